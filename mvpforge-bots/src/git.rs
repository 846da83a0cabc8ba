//! Commit the saved output tree to a local git repository.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

const GITIGNORE: &str = "__pycache__/\n*.pyc\n*.pyo\n.DS_Store\nvenv/\n*.log\n";
const AUTHOR_NAME: &str = "mvpforge";
const AUTHOR_EMAIL: &str = "mvpforge@localhost";

pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args([
                "-c",
                &format!("user.name={AUTHOR_NAME}"),
                "-c",
                &format!("user.email={AUTHOR_EMAIL}"),
            ])
            .args(args)
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run git")?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn is_initialized(&self) -> bool {
        self.path.join(".git").exists()
    }

    /// `git init` with a default .gitignore, unless a repository already exists.
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.git(&["init", "--quiet"]).await?;
        let ignore = self.path.join(".gitignore");
        if !ignore.exists() {
            tokio::fs::write(&ignore, GITIGNORE).await?;
        }
        tracing::info!(path = %self.path.display(), "Initialized git repository");
        Ok(())
    }

    /// Stage everything and commit. Returns false when there was nothing to commit.
    pub async fn commit_all(&self, message: &str) -> Result<bool> {
        self.git(&["add", "--all"]).await?;
        let status = self.git(&["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        self.git(&["commit", "--quiet", "-m", message]).await?;
        tracing::info!(path = %self.path.display(), message, "Committed build output");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_init_and_commit() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::new(dir.path());
        repo.init().await.unwrap();
        assert!(repo.is_initialized());
        // Idempotent.
        repo.init().await.unwrap();

        std::fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
        assert!(repo.commit_all("[BuildCoordinator] Add app.py").await.unwrap());
        assert!(!repo.commit_all("nothing new").await.unwrap());
    }
}

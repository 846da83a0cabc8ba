//! Filesystem and shell tools used by the build agents.
//!
//! The output tree is only ever touched through [`Workspace`], which writes
//! atomically and refuses paths that escape its root.

use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::process::Command;

/// Substrings that mark a shell command as destructive.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "sudo rm",
    "format",
    "dd if=",
    "mkfs",
    "fdisk",
    ":(){ :|:& };:",
    "> /dev/sd",
    "shutdown",
    "reboot",
];

const MAX_OUTPUT: usize = 8000;

/// `path` as a path that stays under whatever root it is joined to: not
/// empty, not absolute, no `..`.
pub fn relative_path(path: &str) -> Result<&Path> {
    let rel = Path::new(path);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || escapes {
        anyhow::bail!("refusing to write outside the workspace: {path:?}");
    }
    Ok(rel)
}

/// The build's output directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) a workspace rooted at `root`.
    pub async fn create(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Resolve a relative path, rejecting absolute paths and `..`.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(relative_path(path)?))
    }

    /// Write a file relative to the workspace root, creating parent
    /// directories. The file is replaced atomically.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf> {
        let full = self.resolve(path)?;
        let content = content.to_string();
        let target = full.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &content)).await??;
        Ok(full)
    }

    /// Read a file relative to workspace root.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {path}"))
    }

    /// List files in workspace, sorted.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let mut files = tokio::task::spawn_blocking(move || list_files_sync(&root)).await?;
        files.sort();
        Ok(files)
    }
}

fn write_atomic(target: &Path, content: &str) -> Result<()> {
    let dir = target
        .parent()
        .context("write target has no parent directory")?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(target)
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    Ok(())
}

fn list_files_sync(root: &Path) -> Vec<String> {
    let mut result = Vec::new();
    fn walk(dir: &Path, root: &Path, result: &mut Vec<String>) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let name = path.file_name().unwrap_or_default().to_string_lossy();
                    if name.starts_with('.') || name == "__pycache__" || name == "node_modules" {
                        continue;
                    }
                    walk(&path, root, result);
                } else if let Ok(rel) = path.strip_prefix(root) {
                    result.push(rel.to_string_lossy().to_string());
                }
            }
        }
    }
    walk(root, root, &mut result);
    result
}

/// Result of one shell command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub return_code: Option<i32>,
}

/// A command the build ran (or refused to run), for the build report.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub task: String,
    pub result: CommandResult,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub fn is_dangerous(command: &str) -> bool {
    let lower = command.to_lowercase();
    DANGEROUS_PATTERNS.iter().any(|p| lower.contains(p))
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... (truncated)");
    }
    text
}

fn shell_program() -> &'static str {
    if Path::new("/bin/zsh").exists() {
        "/bin/zsh"
    } else if Path::new("/bin/bash").exists() {
        "/bin/bash"
    } else {
        "sh"
    }
}

/// Run `cmd` through the shell in `cwd`. The child is killed on timeout.
pub async fn shell(cwd: &Path, cmd: &str, timeout: Duration) -> Result<CommandResult> {
    let mut command = Command::new(shell_program());
    command.arg("-c").arg(cmd).current_dir(cwd).kill_on_drop(true);

    let mut result = CommandResult {
        command: cmd.to_string(),
        ..Default::default()
    };
    match tokio::time::timeout(timeout, command.output()).await {
        Err(_) => {
            result.error = format!("Command execution timeout (>{:.1}s)", timeout.as_secs_f64());
        }
        Ok(output) => {
            let output = output.context("Failed to execute command")?;
            result.output = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
            result.error = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
            result.return_code = output.status.code();
            result.success = output.status.success();
        }
    }
    Ok(result)
}

/// Run a generated command unless it matches [`DANGEROUS_PATTERNS`].
/// Never fails: spawn errors are reported in the result.
pub async fn execute_command_safe(cmd: &str, cwd: &Path, timeout: Duration) -> CommandResult {
    if is_dangerous(cmd) {
        tracing::warn!(command = cmd, "Dangerous command blocked");
        return CommandResult {
            command: cmd.to_string(),
            error: "Dangerous command blocked for safety".to_string(),
            ..Default::default()
        };
    }
    match shell(cwd, cmd, timeout).await {
        Ok(result) => result,
        Err(e) => CommandResult {
            command: cmd.to_string(),
            error: format!("{e:#}"),
            ..Default::default()
        },
    }
}

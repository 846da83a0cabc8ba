//! Scratch area and runner for generated tests.
//!
//! Each build owns one [`SandboxDir`]; it is removed when the build ends.
//! Test scripts are run through a [`Sandbox`], which must enforce a hard
//! wall-clock limit and never leave the child running.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::request::TestResult;
use crate::tools::relative_path;

/// What a sandboxed run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn into_test_result(self) -> TestResult {
        TestResult {
            passed: self.exit_code == Some(0) && !self.timed_out,
            output: self.stdout,
            errors: self.stderr,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, file: &Path, working_dir: &Path, timeout: Duration) -> Result<ExecOutput>;
}

/// Runs test scripts with a Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    interpreter: String,
}

impl PythonSandbox {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for PythonSandbox {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl Sandbox for PythonSandbox {
    async fn run(&self, file: &Path, working_dir: &Path, timeout: Duration) -> Result<ExecOutput> {
        let child = Command::new(&self.interpreter)
            .arg(file)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            // The future (and with it the child) is dropped here, which kills it.
            Err(_) => Ok(ExecOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("Test execution timeout (>{:.1}s)", timeout.as_secs_f64()),
                timed_out: true,
            }),
            Ok(output) => {
                let output = output
                    .with_context(|| format!("Failed to run {} {}", self.interpreter, file.display()))?;
                Ok(ExecOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            }
        }
    }
}

/// Temporary directory owned by one build.
pub struct SandboxDir {
    dir: tempfile::TempDir,
}

impl SandboxDir {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("build_sandbox_")
            .tempdir()
            .context("Failed to create sandbox directory")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stage_test(&self, file: &str, code: &str, test_code: &str) -> Result<PathBuf> {
        stage_test(self.path(), file, code, test_code)
    }

    /// Remove the directory now, reporting failures.
    pub fn cleanup(self) -> Result<()> {
        let path = self.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove sandbox {}", path.display()))
    }
}

/// Lay out `file` and its test script under `root` for a run. The module
/// is written both at its relative path and under its bare file name so the
/// test can import it either way. Returns the test script path.
pub fn stage_test(root: &Path, file: &str, code: &str, test_code: &str) -> Result<PathBuf> {
    let rel = relative_path(file)?;
    let staged = root.join(rel);
    if let Some(parent) = staged.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&staged, code)?;
    if let Some(name) = rel.file_name() {
        std::fs::write(root.join(name), code)?;
    }

    let test_path = root.join(format!("test_{}.py", file.replace(['/', '\\'], "_")));
    let prelude = format!(
        "import sys\nsys.path.insert(0, {:?})\n",
        root.to_string_lossy()
    );
    std::fs::write(&test_path, format!("{prelude}{test_code}"))?;
    Ok(test_path)
}

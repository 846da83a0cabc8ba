//! Per-file build state.
//!
//! [`FileRegistry`] owns one [`FileRecord`] per file path. Every read or
//! write of a record goes through [`FileRegistry::lock`], which serializes
//! transitions for that file without blocking other files.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::request::TestResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    #[default]
    Init,
    Generating,
    Reviewing,
    Testing,
    Fixing,
    RollbackAssessment,
    RolledBack,
    Improving,
    Done,
}

impl FileState {
    /// No further work is scheduled for the file.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Done | FileState::RolledBack)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::Init => write!(f, "init"),
            FileState::Generating => write!(f, "generating"),
            FileState::Reviewing => write!(f, "reviewing"),
            FileState::Testing => write!(f, "testing"),
            FileState::Fixing => write!(f, "fixing"),
            FileState::RollbackAssessment => write!(f, "rollback_assessment"),
            FileState::RolledBack => write!(f, "rolled_back"),
            FileState::Improving => write!(f, "improving"),
            FileState::Done => write!(f, "done"),
        }
    }
}

/// One accepted snapshot of a file. Appended, never edited.
#[derive(Debug, Clone, Serialize)]
pub struct FileVersion {
    pub index: usize,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub test_result: Option<TestResult>,
}

#[derive(Debug, Default)]
pub struct FileRecord {
    pub description: String,
    pub state: FileState,
    pub fix_count: u32,
    /// Consecutive safety rejections since the last accepted content.
    pub safety_attempts: u32,
    /// Latest content that passed the safety scan.
    pub code: Option<String>,
    pub review: Option<String>,
    pub test_code: Option<String>,
    pub test_result: Option<TestResult>,
    /// Gave up after repeated safety rejections.
    pub abandoned: bool,
    pub versions: Vec<FileVersion>,
    pub history: Vec<FileState>,
}

impl FileRecord {
    fn new() -> Self {
        Self {
            history: vec![FileState::Init],
            ..Default::default()
        }
    }

    pub fn transition(&mut self, file: &str, to: FileState) {
        if self.state == to {
            return;
        }
        tracing::debug!(file, from = %self.state, to = %to, fix_count = self.fix_count, "State change");
        self.state = to;
        self.history.push(to);
    }

    pub fn save_version(&mut self, code: &str, test_result: Option<TestResult>) -> usize {
        let index = self.versions.len();
        self.versions.push(FileVersion {
            index,
            code: code.to_string(),
            timestamp: Utc::now(),
            test_result,
        });
        index
    }

    /// Most recent version whose test run passed.
    pub fn last_passing_version(&self) -> Option<&FileVersion> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.test_result.as_ref().is_some_and(|r| r.passed))
    }
}

/// Read-only view of a record, for reports and checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub state: FileState,
    pub fix_count: u32,
    pub history: Vec<FileState>,
    pub versions: usize,
    pub abandoned: bool,
    #[serde(skip)]
    pub code: Option<String>,
    pub test_result: Option<TestResult>,
}

impl From<&FileRecord> for FileSummary {
    fn from(r: &FileRecord) -> Self {
        Self {
            state: r.state,
            fix_count: r.fix_count,
            history: r.history.clone(),
            versions: r.versions.len(),
            abandoned: r.abandoned,
            code: r.code.clone(),
            test_result: r.test_result.clone(),
        }
    }
}

#[derive(Default)]
pub struct FileRegistry {
    files: RwLock<HashMap<String, Arc<Mutex<FileRecord>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, file: &str) -> Arc<Mutex<FileRecord>> {
        if let Some(record) = self.files.read().get(file) {
            return record.clone();
        }
        self.files
            .write()
            .entry(file.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(FileRecord::new())))
            .clone()
    }

    /// Lock `file`'s record, creating it in `init` on first use.
    pub async fn lock(&self, file: &str) -> OwnedMutexGuard<FileRecord> {
        self.entry(file).lock_owned().await
    }

    /// Known file paths, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.files.read().keys().cloned().collect();
        files.sort();
        files
    }

    pub async fn summary(&self, file: &str) -> Option<FileSummary> {
        let record = self.files.read().get(file).cloned()?;
        let guard = record.lock().await;
        Some(FileSummary::from(&*guard))
    }

    pub async fn snapshot(&self) -> BTreeMap<String, FileSummary> {
        let mut out = BTreeMap::new();
        for file in self.files() {
            if let Some(summary) = self.summary(&file).await {
                out.insert(file, summary);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(passed: bool) -> TestResult {
        TestResult {
            passed,
            ..Default::default()
        }
    }

    #[test]
    fn test_last_passing_version() {
        let mut record = FileRecord::new();
        assert!(record.last_passing_version().is_none());
        record.save_version("v0", None);
        record.save_version("v1", Some(result(true)));
        record.save_version("v2", Some(result(false)));
        assert_eq!(record.last_passing_version().unwrap().index, 1);

        record.save_version("v3", Some(result(true)));
        assert_eq!(record.last_passing_version().unwrap().code, "v3");
    }

    #[test]
    fn test_transition_records_history() {
        let mut record = FileRecord::new();
        record.transition("app.py", FileState::Generating);
        record.transition("app.py", FileState::Generating);
        record.transition("app.py", FileState::Reviewing);
        assert_eq!(
            record.history,
            vec![FileState::Init, FileState::Generating, FileState::Reviewing]
        );
        assert!(!record.state.is_terminal());
        record.transition("app.py", FileState::Done);
        assert!(record.state.is_terminal());
    }

    #[tokio::test]
    async fn test_per_file_locks_are_independent() {
        let registry = Arc::new(FileRegistry::new());
        let held = registry.lock("a.py").await;

        // Another file is not blocked by a.py's lock.
        let other = tokio::time::timeout(std::time::Duration::from_millis(100), registry.lock("b.py")).await;
        assert!(other.is_ok());
        drop(other);

        // The same file is.
        let same = tokio::time::timeout(std::time::Duration::from_millis(50), registry.lock("a.py")).await;
        assert!(same.is_err());
        drop(held);

        assert_eq!(registry.files(), vec!["a.py".to_string(), "b.py".to_string()]);
        let snap = registry.snapshot().await;
        assert_eq!(snap["a.py"].state, FileState::Init);
    }
}

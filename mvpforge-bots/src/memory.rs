//! Build checkpoints backed by SQLite.
//!
//! One checkpoint per output directory, replaced at each phase boundary and
//! cleared once the build's files are saved. A build started with `resume`
//! reuses the files an interrupted run had already finished.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::request::TestResult;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    Planning,
    Generating,
    Saving,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildPhase::Planning => write!(f, "planning"),
            BuildPhase::Generating => write!(f, "generating"),
            BuildPhase::Saving => write!(f, "saving"),
        }
    }
}

/// Snapshot of a build in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub files_completed: Vec<String>,
    pub files_pending: Vec<String>,
    pub test_results: BTreeMap<String, TestResult>,
    pub generated_files: BTreeMap<String, String>,
    pub current_phase: BuildPhase,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// What an interrupted build left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub can_recover: bool,
    pub files_completed: usize,
    pub files_pending: usize,
    pub current_phase: Option<BuildPhase>,
    pub age_seconds: i64,
}

/// Checkpoint store.
pub struct CheckpointStore {
    db: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create a checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .map_err(|e| BuildError::Checkpoint(format!("{}: {e}", dir.display())))?;
        }
        let db = Connection::open(path)?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                project TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS build_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_build_log_project
                ON build_log(project, kind);",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Store `checkpoint` for `project`, replacing any earlier one.
    pub fn save(&self, project: &str, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_string(checkpoint)
            .map_err(|e| BuildError::Checkpoint(e.to_string()))?;
        self.db.lock().execute(
            "INSERT OR REPLACE INTO checkpoints (project, phase, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                project,
                checkpoint.current_phase.to_string(),
                data,
                checkpoint.timestamp.to_rfc3339()
            ],
        )?;
        tracing::debug!(
            project,
            phase = %checkpoint.current_phase,
            completed = checkpoint.files_completed.len(),
            pending = checkpoint.files_pending.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    pub fn load(&self, project: &str) -> Result<Option<Checkpoint>> {
        let data: Option<String> = self
            .db
            .lock()
            .query_row(
                "SELECT data FROM checkpoints WHERE project = ?1",
                rusqlite::params![project],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(|e| BuildError::Checkpoint(e.to_string())))
            .transpose()
    }

    /// Drop the checkpoint after a completed build.
    pub fn clear(&self, project: &str) -> Result<bool> {
        let n = self.db.lock().execute(
            "DELETE FROM checkpoints WHERE project = ?1",
            rusqlite::params![project],
        )?;
        Ok(n > 0)
    }

    pub fn recovery_summary(&self, project: &str) -> Result<RecoverySummary> {
        Ok(match self.load(project)? {
            Some(cp) => RecoverySummary {
                can_recover: true,
                files_completed: cp.files_completed.len(),
                files_pending: cp.files_pending.len(),
                current_phase: Some(cp.current_phase),
                age_seconds: (Utc::now() - cp.timestamp).num_seconds(),
            },
            None => RecoverySummary {
                can_recover: false,
                files_completed: 0,
                files_pending: 0,
                current_phase: None,
                age_seconds: 0,
            },
        })
    }

    /// Append to the build log.
    pub fn log(&self, project: &str, kind: &str, value: &str) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO build_log (project, kind, value, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![project, kind, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Log entries of `kind`, oldest first.
    pub fn history(&self, project: &str, kind: &str) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT value FROM build_log WHERE project = ?1 AND kind = ?2 ORDER BY id ASC",
        )?;
        let values = stmt
            .query_map(rusqlite::params![project, kind], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(phase: BuildPhase) -> Checkpoint {
        let mut generated = BTreeMap::new();
        generated.insert("app.py".to_string(), "print('hi')".to_string());
        Checkpoint {
            timestamp: Utc::now(),
            files_completed: vec!["app.py".into()],
            files_pending: vec!["templates/index.html".into()],
            test_results: BTreeMap::new(),
            generated_files: generated,
            current_phase: phase,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_save_load_replace_clear() {
        let store = CheckpointStore::in_memory().unwrap();
        assert!(store.load("/out").unwrap().is_none());

        store.save("/out", &checkpoint(BuildPhase::Planning)).unwrap();
        store.save("/out", &checkpoint(BuildPhase::Generating)).unwrap();
        let loaded = store.load("/out").unwrap().unwrap();
        assert_eq!(loaded.current_phase, BuildPhase::Generating);
        assert_eq!(loaded.generated_files["app.py"], "print('hi')");

        assert!(store.clear("/out").unwrap());
        assert!(!store.clear("/out").unwrap());
        assert!(store.load("/out").unwrap().is_none());
    }

    #[test]
    fn test_recovery_summary() {
        let store = CheckpointStore::in_memory().unwrap();
        assert!(!store.recovery_summary("/out").unwrap().can_recover);

        store.save("/out", &checkpoint(BuildPhase::Saving)).unwrap();
        let summary = store.recovery_summary("/out").unwrap();
        assert!(summary.can_recover);
        assert_eq!(summary.files_completed, 1);
        assert_eq!(summary.files_pending, 1);
        assert_eq!(summary.current_phase, Some(BuildPhase::Saving));
        assert!(summary.age_seconds >= 0);
    }

    #[test]
    fn test_build_log() {
        let store = CheckpointStore::in_memory().unwrap();
        store.log("/out", "phase", "planning").unwrap();
        store.log("/out", "phase", "generating").unwrap();
        store.log("/other", "phase", "saving").unwrap();
        assert_eq!(
            store.history("/out", "phase").unwrap(),
            vec!["planning".to_string(), "generating".to_string()]
        );
    }
}

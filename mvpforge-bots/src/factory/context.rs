//! State shared by every handler of one build.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use mvpforge_sdk::{AgentId, MessageBus, TaskTracker};
use parking_lot::Mutex;

use crate::config::BuildConfig;
use crate::memory::{BuildPhase, Checkpoint, CheckpointStore};
use crate::request::Request;
use crate::roster::Role;
use crate::safety::SafetyScanner;
use crate::sandbox::Sandbox;
use crate::tools::CommandRecord;

pub const PLAN_TASK: &str = "generate_plan";
const PLAN_KEY: &str = "plan";

pub fn code_gen_id(file: &str) -> String {
    format!("code_gen_{file}")
}

pub fn review_id(file: &str) -> String {
    format!("review_{file}")
}

pub fn test_gen_id(file: &str) -> String {
    format!("test_gen_{file}")
}

pub fn test_run_id(file: &str) -> String {
    format!("test_run_{file}")
}

/// Ids the driver waits on for `file`. All of them are complete once the
/// file reaches a terminal state.
pub fn tracked_ids(file: &str) -> [String; 4] {
    [code_gen_id(file), review_id(file), test_gen_id(file), test_run_id(file)]
}

pub struct BuildContext {
    pub config: BuildConfig,
    pub bus: MessageBus<Request>,
    pub tracker: TaskTracker,
    pub files: super::state::FileRegistry,
    pub scanner: SafetyScanner,
    pub sandbox: Arc<dyn Sandbox>,
    pub sandbox_path: PathBuf,
    pub checkpoints: Option<Arc<CheckpointStore>>,
    pub plan: Mutex<Option<String>>,
    pub commands: Mutex<Vec<CommandRecord>>,
    /// Files requested by the current build, in dispatch order.
    pub planned: Mutex<Vec<String>>,
    /// Raw ideation response, for adaptive builds.
    pub ideation: Mutex<Option<String>>,
    ids: HashMap<Role, AgentId>,
}

impl BuildContext {
    pub fn new(
        config: BuildConfig,
        sandbox: Arc<dyn Sandbox>,
        sandbox_path: PathBuf,
        checkpoints: Option<Arc<CheckpointStore>>,
        ids: HashMap<Role, AgentId>,
    ) -> Self {
        Self {
            config,
            bus: MessageBus::new(),
            tracker: TaskTracker::new(),
            files: super::state::FileRegistry::new(),
            scanner: SafetyScanner::new(),
            sandbox,
            sandbox_path,
            checkpoints,
            plan: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            planned: Mutex::new(Vec::new()),
            ideation: Mutex::new(None),
            ids,
        }
    }

    /// Route `request` over the bus. Unknown roles are dropped like any
    /// other dangling reference.
    pub fn send(&self, from: Role, to: Role, request: Request) -> bool {
        match (self.ids.get(&from), self.ids.get(&to)) {
            (Some(from), Some(to)) => self.bus.send_to_agent(from, to, request),
            _ => {
                tracing::warn!(%from, %to, "No agent for role; message dropped");
                false
            }
        }
    }

    pub fn project_key(&self) -> String {
        self.config.output_dir.display().to_string()
    }

    /// Mark every tracked id of `file` complete.
    pub fn complete_tracked(&self, file: &str) {
        for id in tracked_ids(file) {
            self.tracker.create_task(&id);
            self.tracker.complete_task(&id);
        }
    }

    /// Called once a file reaches a terminal state.
    pub async fn file_finished(&self, file: &str) {
        self.complete_tracked(file);
        self.checkpoint(BuildPhase::Generating).await;
    }

    /// Persist progress if a checkpoint store is attached. Failures are logged.
    pub async fn checkpoint(&self, phase: BuildPhase) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let snapshot = self.files.snapshot().await;
        let planned = self.planned.lock().clone();

        let mut checkpoint = Checkpoint {
            timestamp: chrono::Utc::now(),
            files_completed: Vec::new(),
            files_pending: Vec::new(),
            test_results: BTreeMap::new(),
            generated_files: BTreeMap::new(),
            current_phase: phase,
            metadata: BTreeMap::new(),
        };
        for file in planned {
            match snapshot.get(&file) {
                Some(summary) if summary.state.is_terminal() => {
                    if let Some(code) = &summary.code {
                        checkpoint.generated_files.insert(file.clone(), code.clone());
                    }
                    if let Some(result) = &summary.test_result {
                        checkpoint.test_results.insert(file.clone(), result.clone());
                    }
                    checkpoint.files_completed.push(file);
                }
                _ => checkpoint.files_pending.push(file),
            }
        }
        if let Some(plan) = self.plan.lock().clone() {
            checkpoint.metadata.insert(PLAN_KEY.to_string(), plan);
        }

        if let Err(e) = store.save(&self.project_key(), &checkpoint) {
            tracing::warn!(error = %e, "Failed to save checkpoint");
        }
    }

    /// Plan text stored in a checkpoint, if any.
    pub fn plan_from(checkpoint: &Checkpoint) -> Option<String> {
        checkpoint.metadata.get(PLAN_KEY).cloned()
    }
}

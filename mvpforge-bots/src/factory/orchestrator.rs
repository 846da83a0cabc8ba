//! The build driver: wires the roster, dispatches work and saves results.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use mvpforge_sdk::wait::wait_for_agents_idle;
use mvpforge_sdk::{Agent, MessageBus, TaskTracker, wait_for_completion};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::context::{BuildContext, PLAN_TASK, tracked_ids};
use super::handlers::{Reviewer, Rollback, TestRunner, TestWriter, Writer};
use super::state::{FileState, FileSummary};
use super::support::{CommandRunner, CommandWriter, Iteration, Planner, Validation};
use crate::adaptive::Ideation;
use crate::config::BuildConfig;
use crate::git::GitRepo;
use crate::memory::{BuildPhase, CheckpointStore};
use crate::output;
use crate::request::{BuildTask, Request, TestResult};
use crate::roster::{ModelSet, Persona, Role, Roster};
use crate::sandbox::{Sandbox, SandboxDir};
use crate::tools::{CommandRecord, Workspace, relative_path};

const PLAN_FILE: &str = "BUILD_PLAN.md";
const PLAN_POLL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a build produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    /// Files that ended with content.
    pub generated: usize,
    pub saved: usize,
    pub saved_files: Vec<PathBuf>,
    pub tests: BTreeMap<String, TestResult>,
    pub plan: String,
    pub command_history: Vec<CommandRecord>,
    pub file_states: BTreeMap<String, FileSummary>,
    /// False when the build hit its timeout before every file finished.
    pub completed: bool,
    /// Set by adaptive builds.
    pub inferred_tasks: Vec<BuildTask>,
    pub project_analysis: String,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.saved >= 1
    }
}

/// A running set of build agents.
///
/// Agents start in [`BuildPipeline::start`]; [`BuildPipeline::run_build`]
/// (or [`BuildPipeline::finish`]) consumes the pipeline and shuts them down.
pub struct BuildPipeline {
    ctx: Arc<BuildContext>,
    roster: Roster,
    sandbox_dir: Option<SandboxDir>,
    supervisors: Vec<JoinHandle<()>>,
    request_seq: AtomicU64,
}

/// Keep `agent` processing its mailbox until it is stopped and drained.
/// A failed handler is logged and the loop restarted.
fn supervise(agent: Arc<Agent<Request>>) -> JoinHandle<()> {
    agent.start();
    tokio::spawn(async move {
        loop {
            match agent.receive_loop().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(agent = agent.name(), error = format!("{e:#}"), "Handler failed");
                }
            }
            if !agent.is_running() && agent.queue_len() == 0 {
                break;
            }
        }
    })
}

/// Drop duplicate files and paths that would land outside the output or
/// sandbox directories.
fn usable_tasks(tasks: Vec<BuildTask>) -> Vec<BuildTask> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|t| {
            if let Err(e) = relative_path(&t.task) {
                tracing::warn!(file = %t.task, error = %e, "Task path rejected");
                return false;
            }
            let fresh = seen.insert(t.task.clone());
            if !fresh {
                tracing::warn!(file = %t.task, "Duplicate task ignored");
            }
            fresh
        })
        .collect()
}

impl BuildPipeline {
    /// Create the roster, attach handlers and start every agent.
    pub fn start(
        config: BuildConfig,
        models: &ModelSet,
        sandbox: Arc<dyn Sandbox>,
        checkpoints: Option<Arc<CheckpointStore>>,
    ) -> Result<Self> {
        let roster = Roster::new(models);
        let sandbox_dir = SandboxDir::create()?;
        let ids = Role::ALL
            .iter()
            .map(|role| (*role, roster.agent(*role).id().clone()))
            .collect();
        let ctx = Arc::new(BuildContext::new(
            config,
            sandbox,
            sandbox_dir.path().to_path_buf(),
            checkpoints,
            ids,
        ));
        roster.register(&ctx.bus);

        let persona = |role: Role| -> Result<Arc<Persona>> {
            roster
                .persona(role)
                .with_context(|| format!("{role} has no model"))
        };
        let agent = |role: Role| roster.agent(role);
        agent(Role::Planner).set_handler(Arc::new(Planner {
            ctx: ctx.clone(),
            persona: persona(Role::Planner)?,
        }));
        agent(Role::CodeWriter).set_handler(Arc::new(Writer {
            ctx: ctx.clone(),
            persona: persona(Role::CodeWriter)?,
        }));
        agent(Role::CodeReviewer).set_handler(Arc::new(Reviewer {
            ctx: ctx.clone(),
            persona: persona(Role::CodeReviewer)?,
        }));
        agent(Role::TestGenerator).set_handler(Arc::new(TestWriter {
            ctx: ctx.clone(),
            persona: persona(Role::TestGenerator)?,
        }));
        agent(Role::TestRunner).set_handler(Arc::new(TestRunner { ctx: ctx.clone() }));
        agent(Role::RollbackAgent).set_handler(Arc::new(Rollback {
            ctx: ctx.clone(),
            persona: persona(Role::RollbackAgent)?,
        }));
        agent(Role::CommandGenerator).set_handler(Arc::new(CommandWriter {
            ctx: ctx.clone(),
            persona: persona(Role::CommandGenerator)?,
        }));
        agent(Role::CommandExecutor).set_handler(Arc::new(CommandRunner { ctx: ctx.clone() }));
        agent(Role::IterationAgent).set_handler(Arc::new(Iteration { ctx: ctx.clone() }));
        agent(Role::ValidationAgent).set_handler(Arc::new(Validation {
            ctx: ctx.clone(),
            persona: persona(Role::ValidationAgent)?,
        }));
        agent(Role::IdeationAgent).set_handler(Arc::new(Ideation {
            ctx: ctx.clone(),
            persona: persona(Role::IdeationAgent)?,
        }));

        let supervisors = roster.agents().into_iter().map(supervise).collect();
        tracing::info!(
            agents = Role::ALL.len(),
            output = %ctx.config.output_dir.display(),
            "Build agents started"
        );
        Ok(Self {
            ctx,
            roster,
            sandbox_dir: Some(sandbox_dir),
            supervisors,
            request_seq: AtomicU64::new(0),
        })
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.ctx.tracker
    }

    pub fn bus(&self) -> &MessageBus<Request> {
        &self.ctx.bus
    }

    pub fn config(&self) -> &BuildConfig {
        &self.ctx.config
    }

    pub(crate) fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    pub(crate) fn agent(&self, role: Role) -> Arc<Agent<Request>> {
        self.roster.agent(role)
    }

    pub async fn file_summary(&self, file: &str) -> Option<FileSummary> {
        self.ctx.files.summary(file).await
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.request_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Have the command agents produce and (if allowed) run a shell command
    /// in the output directory. `None` when nothing was recorded in time.
    pub async fn request_command(&self, description: &str, context: &str) -> Result<Option<CommandRecord>> {
        let ctx = &self.ctx;
        let working_dir = Workspace::create(&ctx.config.output_dir).await?.root;
        let task_id = self.next_id("command");
        ctx.tracker.create_task(&task_id);
        ctx.send(
            Role::Coordinator,
            Role::CommandGenerator,
            Request::GenerateCommand {
                task_description: description.to_string(),
                context: context.to_string(),
                working_dir,
                task_id: task_id.clone(),
            },
        );

        let budget = ctx.config.command_timeout + ctx.config.plan_timeout;
        if !ctx.tracker.wait_for_task(&task_id, budget).await {
            tracing::warn!(task_id, "Command request timed out");
            return Ok(None);
        }
        Ok(ctx
            .commands
            .lock()
            .iter()
            .rev()
            .find(|r| r.task == description)
            .cloned())
    }

    /// Ask for another improvement round on `file`. Returns the task id the
    /// iteration agent completes once the request is forwarded.
    pub fn request_iteration(&self, file: &str, test_result: TestResult, iteration: u32) -> String {
        let task_id = format!("iterate_{file}_{iteration}");
        self.ctx.tracker.create_task(&task_id);
        self.ctx.send(
            Role::Coordinator,
            Role::IterationAgent,
            Request::Iterate {
                file: file.to_string(),
                test_result,
                iteration,
                task_id: task_id.clone(),
            },
        );
        task_id
    }

    /// Run the structural check on `code`. Returns the validation task id.
    pub fn request_validation(&self, file: &str, code: &str) -> String {
        let task_id = self.next_id(&format!("validate_{file}"));
        self.ctx.tracker.create_task(&task_id);
        self.ctx.send(
            Role::Coordinator,
            Role::ValidationAgent,
            Request::ValidateCode {
                file: file.to_string(),
                code: code.to_string(),
                task_id: task_id.clone(),
            },
        );
        task_id
    }

    /// Build `tasks` and save the results.
    ///
    /// Plans (optionally), dispatches one code request per file, waits for
    /// every file to settle or the timeout, stops the agents, then writes
    /// each file whose content still passes the safety scan.
    pub async fn run_build(mut self, tasks: Vec<BuildTask>, description: &str) -> Result<BuildReport> {
        match self.generate(tasks, description).await {
            Ok(completed) => self.finish(completed).await,
            Err(e) => {
                self.shutdown().await;
                self.cleanup_sandbox();
                Err(e)
            }
        }
    }

    /// The first half of [`run_build`](Self::run_build): plan, dispatch and
    /// wait. Returns false on timeout. Agents keep running afterwards, so
    /// iteration and validation requests can follow before [`finish`](Self::finish).
    pub async fn generate(&self, tasks: Vec<BuildTask>, description: &str) -> Result<bool> {
        self.coordinate(tasks, description).await
    }

    /// Wait until no agent has work queued or in flight.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        wait_for_agents_idle(&self.roster.agents(), timeout, self.ctx.config.poll_interval).await
    }

    /// Stop the agents and save the results.
    pub async fn finish(mut self, completed: bool) -> Result<BuildReport> {
        self.shutdown().await;
        self.finalize(completed).await
    }

    async fn coordinate(&self, tasks: Vec<BuildTask>, description: &str) -> Result<bool> {
        let ctx = &self.ctx;
        let config = &ctx.config;
        Workspace::create(&config.output_dir).await?;
        for dir in [&config.templates_dir, &config.static_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let tasks = usable_tasks(tasks);
        *ctx.planned.lock() = tasks.iter().map(|t| t.task.clone()).collect();
        output::status(Role::Coordinator, "🚀", &format!("Building {} files", tasks.len()));

        let restored = if config.resume {
            self.restore().await
        } else {
            HashSet::new()
        };

        if config.generate_plan && ctx.plan.lock().is_none() {
            ctx.checkpoint(BuildPhase::Planning).await;
            ctx.tracker.create_task(PLAN_TASK);
            ctx.send(
                Role::Coordinator,
                Role::Planner,
                Request::GeneratePlan {
                    project_description: description.to_string(),
                    build_tasks: tasks.clone(),
                    task_id: PLAN_TASK.to_string(),
                },
            );
            let planner = [self.roster.agent(Role::Planner)];
            let planned = wait_for_completion(
                &planner,
                Some(&ctx.tracker),
                &[PLAN_TASK.to_string()],
                config.plan_timeout,
                PLAN_POLL,
            )
            .await;
            if !planned {
                tracing::warn!("Plan not ready in time; building without it");
            }
        }
        ctx.checkpoint(BuildPhase::Generating).await;

        let mut expected = Vec::new();
        let pending: Vec<BuildTask> = tasks.into_iter().filter(|t| !restored.contains(&t.task)).collect();
        for (i, task) in pending.into_iter().enumerate() {
            if i > 0 && !config.dispatch_stagger.is_zero() {
                tokio::time::sleep(config.dispatch_stagger).await;
            }
            for id in tracked_ids(&task.task) {
                ctx.tracker.create_task(&id);
                expected.push(id);
            }
            tracing::debug!(file = %task.task, "Dispatching code request");
            ctx.send(Role::Coordinator, Role::CodeWriter, Request::CodeRequest(task));
        }
        if expected.is_empty() {
            return Ok(true);
        }

        let agents = self.roster.agents();
        Ok(wait_for_completion(
            &agents,
            Some(&ctx.tracker),
            &expected,
            config.timeout,
            config.poll_interval,
        )
        .await)
    }

    /// Reload finished files from a previous checkpoint of this output
    /// directory. Returns the files that need no work.
    async fn restore(&self) -> HashSet<String> {
        let ctx = &self.ctx;
        let mut restored = HashSet::new();
        let Some(store) = &ctx.checkpoints else {
            return restored;
        };
        let checkpoint = match store.load(&ctx.project_key()) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return restored,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load checkpoint; starting fresh");
                return restored;
            }
        };

        if let Some(plan) = BuildContext::plan_from(&checkpoint) {
            *ctx.plan.lock() = Some(plan);
        }
        let planned: HashSet<String> = ctx.planned.lock().iter().cloned().collect();
        for file in checkpoint.files_completed {
            if !planned.contains(&file) {
                continue;
            }
            let Some(code) = checkpoint.generated_files.get(&file) else {
                continue;
            };
            if !ctx.scanner.scan(&file, code).0 {
                continue;
            }
            {
                let mut record = ctx.files.lock(&file).await;
                let result = checkpoint.test_results.get(&file).cloned();
                record.code = Some(code.clone());
                record.save_version(code, result.clone());
                record.test_result = result;
                record.transition(&file, FileState::Done);
            }
            ctx.complete_tracked(&file);
            restored.insert(file);
        }
        tracing::info!(
            restored = restored.len(),
            phase = %checkpoint.current_phase,
            "Resumed from checkpoint"
        );
        restored
    }

    async fn shutdown(&mut self) {
        self.roster.stop_all();
        for handle in self.supervisors.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }
        tracing::debug!("Build agents stopped");
    }

    async fn finalize(&mut self, completed: bool) -> Result<BuildReport> {
        let ctx = self.ctx.clone();
        let config = &ctx.config;
        ctx.checkpoint(BuildPhase::Saving).await;

        let workspace = Workspace::create(&config.output_dir).await?;
        let snapshot = ctx.files.snapshot().await;
        let planned = ctx.planned.lock().clone();
        let project = ctx.project_key();
        let mut report = BuildReport {
            completed,
            ..Default::default()
        };

        for file in &planned {
            let Some(summary) = snapshot.get(file) else {
                continue;
            };
            if let Some(result) = &summary.test_result {
                report.tests.insert(file.clone(), result.clone());
            }
            let Some(code) = &summary.code else {
                continue;
            };
            report.generated += 1;

            let (safe, violations) = ctx.scanner.scan(file, code);
            if !safe {
                output::error(
                    Role::Coordinator,
                    &format!("Not saving {file}: {}", violations.join(", ")),
                );
                continue;
            }
            match workspace.write_file(file, code).await {
                Ok(path) => {
                    output::status(Role::Coordinator, "💾", &format!("Saved {}", path.display()));
                    if let Some(store) = &ctx.checkpoints
                        && let Err(e) = store.log(&project, "saved", file)
                    {
                        tracing::debug!(error = %e, "Build log write failed");
                    }
                    report.saved += 1;
                    report.saved_files.push(path);
                }
                Err(e) => output::error(Role::Coordinator, &format!("Failed to save {file}: {e:#}")),
            }
        }

        if let Some(plan) = ctx.plan.lock().clone() {
            report.plan = plan;
        }
        if !report.plan.is_empty()
            && let Err(e) = workspace.write_file(PLAN_FILE, &report.plan).await
        {
            output::error(Role::Coordinator, &format!("Failed to save {PLAN_FILE}: {e:#}"));
        }
        report.command_history = ctx.commands.lock().clone();
        report.file_states = snapshot;

        if config.enable_git && report.saved > 0 {
            let repo = GitRepo::new(&config.output_dir);
            let message = format!("[{}] Build: {} files", Role::Coordinator, report.saved);
            let committed = async {
                repo.init().await?;
                repo.commit_all(&message).await
            };
            if let Err(e) = committed.await {
                tracing::warn!(error = format!("{e:#}"), "Git commit failed");
            }
        }

        // An unfinished build keeps its checkpoint so it can be resumed.
        if completed
            && let Some(store) = &ctx.checkpoints
            && let Err(e) = store.clear(&project)
        {
            tracing::warn!(error = %e, "Failed to clear checkpoint");
        }
        self.cleanup_sandbox();

        output::status(
            Role::Coordinator,
            if report.succeeded() { "🏁" } else { "⚠️" },
            &format!("Build finished: {} generated, {} saved", report.generated, report.saved),
        );
        Ok(report)
    }

    fn cleanup_sandbox(&mut self) {
        if let Some(dir) = self.sandbox_dir.take()
            && let Err(e) = dir.cleanup()
        {
            tracing::warn!(error = format!("{e:#}"), "Sandbox cleanup failed");
        }
    }
}

impl Drop for BuildPipeline {
    fn drop(&mut self) {
        self.roster.stop_all();
        for handle in &self.supervisors {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first() {
        let tasks = vec![
            BuildTask::new("app.py", "first"),
            BuildTask::new("util.py", ""),
            BuildTask::new("app.py", "second"),
        ];
        let tasks = usable_tasks(tasks);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].description, "first");
    }

    #[test]
    fn test_report_success_needs_a_saved_file() {
        let mut report = BuildReport::default();
        assert!(!report.succeeded());
        report.saved = 1;
        assert!(report.succeeded());
    }
}

//! End-to-end builds with scripted models and stub sandboxes.
//!
//! Tests cover:
//! - Passing build: files saved, plan written, full state history
//! - Task paths outside the project are never staged or built
//! - Failing tests with no fix budget: rollback assessment, then done
//! - Fix loop converging on a passing version
//! - Iteration regressing, then rolled back to the last passing version
//! - Unsafe content abandoned after the rewrite budget
//! - Shell commands: disabled, enabled and blocked
//! - Resuming from a checkpoint
//! - Validation requests

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{ScriptedModel, StubSandbox, common_reply, config, models};
use mvpforge_bots::memory::{BuildPhase, Checkpoint, CheckpointStore};
use mvpforge_bots::{BuildPipeline, BuildTask, FileState, TestResult};

fn code_reply(prompt: &str) -> String {
    common_reply(prompt).unwrap_or_else(|| "```python\nprint('hello')\n```".to_string())
}

#[tokio::test]
async fn passing_build_saves_every_file_and_the_plan() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(code_reply);
    let mut cfg = config(dir.path());
    cfg.generate_plan = true;
    let out = cfg.output_dir.clone();

    let pipeline = BuildPipeline::start(cfg, &models(&model), StubSandbox::always(true), None).unwrap();
    let report = pipeline
        .run_build(
            vec![
                BuildTask::new("app.py", "Print a greeting"),
                BuildTask::new("utils/helpers.py", "Helpers"),
            ],
            "greeter",
        )
        .await
        .unwrap();

    assert!(report.completed);
    assert_eq!(report.generated, 2);
    assert_eq!(report.saved, 2);
    assert!(report.succeeded());
    assert_eq!(std::fs::read_to_string(out.join("app.py")).unwrap(), "print('hello')");
    assert!(out.join("utils/helpers.py").exists());
    assert!(out.join("templates").is_dir());
    assert!(out.join("static").is_dir());

    assert!(report.plan.starts_with("# Plan"));
    assert!(out.join("BUILD_PLAN.md").exists());

    let app = &report.file_states["app.py"];
    assert_eq!(
        app.history,
        vec![
            FileState::Init,
            FileState::Generating,
            FileState::Reviewing,
            FileState::Testing,
            FileState::Done
        ]
    );
    assert!(report.tests["app.py"].passed);
}

#[tokio::test]
async fn task_paths_outside_the_project_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(code_reply);
    let sandbox = StubSandbox::always(true);
    let cfg = config(dir.path());
    let out = cfg.output_dir.clone();
    let absolute = dir.path().join("absolute_task.py");

    let pipeline = BuildPipeline::start(cfg, &models(&model), sandbox.clone(), None).unwrap();
    let report = pipeline
        .run_build(
            vec![
                BuildTask::new("../mvpforge_escaped_task.py", "Escape the sandbox"),
                BuildTask::new(absolute.to_str().unwrap(), "Absolute path"),
                BuildTask::new("app.py", "Print a greeting"),
            ],
            "greeter",
        )
        .await
        .unwrap();

    assert_eq!(report.saved, 1);
    assert_eq!(report.file_states.len(), 1);
    assert!(out.join("app.py").exists());
    assert!(!dir.path().join("mvpforge_escaped_task.py").exists());
    assert!(!std::env::temp_dir().join("mvpforge_escaped_task.py").exists());
    assert!(!absolute.exists());
    assert!(!model.saw("Escape the sandbox"));
    assert_eq!(sandbox.runs(), 1);
}

#[tokio::test]
async fn failing_tests_without_fix_budget_are_assessed_then_kept() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(code_reply);
    let sandbox = StubSandbox::always(false);
    let mut cfg = config(dir.path());
    cfg.max_fix_attempts = 0;

    let pipeline = BuildPipeline::start(cfg, &models(&model), sandbox.clone(), None).unwrap();
    let report = pipeline
        .run_build(vec![BuildTask::new("app.py", "Print a greeting")], "")
        .await
        .unwrap();

    let app = &report.file_states["app.py"];
    assert_eq!(app.state, FileState::Done);
    assert_eq!(
        app.history[app.history.len() - 2..],
        [FileState::RollbackAssessment, FileState::Done]
    );
    assert!(!app.history.contains(&FileState::Fixing));
    assert!(!app.history.contains(&FileState::RolledBack));
    assert_eq!(app.fix_count, 0);
    assert_eq!(sandbox.runs(), 1);

    // No working version exists, but the content is still safe to keep.
    assert!(!report.tests["app.py"].passed);
    assert_eq!(report.saved, 1);
    assert!(model.saw("DECISION: ROLLBACK"));
}

#[tokio::test]
async fn fix_loop_converges() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(|prompt| {
        if let Some(reply) = common_reply(prompt) {
            reply
        } else if prompt.contains("Fix 'app.py'") {
            "total = 1  # FIXED".to_string()
        } else {
            "total = 0".to_string()
        }
    });
    let cfg = config(dir.path());
    let out = cfg.output_dir.clone();

    let pipeline = BuildPipeline::start(
        cfg,
        &models(&model),
        StubSandbox::when_contains("app.py", "FIXED"),
        None,
    )
    .unwrap();
    let report = pipeline
        .run_build(vec![BuildTask::new("app.py", "Sum things")], "")
        .await
        .unwrap();

    let app = &report.file_states["app.py"];
    assert_eq!(app.state, FileState::Done);
    assert_eq!(app.fix_count, 1);
    assert!(app.history.contains(&FileState::Fixing));
    // accepted, tested, accepted fix, tested fix
    assert_eq!(app.versions, 4);
    assert!(report.tests["app.py"].passed);
    assert!(std::fs::read_to_string(out.join("app.py")).unwrap().contains("FIXED"));
}

#[tokio::test]
async fn regression_is_rolled_back_to_last_passing_version() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(|prompt| {
        if prompt.contains("still fails its tests") {
            "The last change broke everything.\nDECISION: ROLLBACK".to_string()
        } else if let Some(reply) = common_reply(prompt) {
            reply
        } else if prompt.contains("Improve 'app.py'") {
            "BAD = 1".to_string()
        } else if prompt.contains("Fix 'app.py'") {
            "BAD = 2".to_string()
        } else {
            "GOOD = 1".to_string()
        }
    });
    let mut cfg = config(dir.path());
    cfg.max_fix_attempts = 1;
    let out = cfg.output_dir.clone();

    let pipeline = BuildPipeline::start(
        cfg,
        &models(&model),
        StubSandbox::when_contains("app.py", "GOOD"),
        None,
    )
    .unwrap();
    assert!(
        pipeline
            .generate(vec![BuildTask::new("app.py", "Flag")], "")
            .await
            .unwrap()
    );
    assert_eq!(pipeline.file_summary("app.py").await.unwrap().state, FileState::Done);

    let passed = TestResult {
        passed: true,
        ..Default::default()
    };
    let iterate = pipeline.request_iteration("app.py", passed, 1);
    assert!(pipeline.tracker().wait_for_task(&iterate, Duration::from_secs(5)).await);
    assert!(pipeline.wait_for_idle(Duration::from_secs(10)).await);

    let app = pipeline.file_summary("app.py").await.unwrap();
    assert_eq!(app.state, FileState::Done);
    assert!(app.history.contains(&FileState::Improving));
    assert!(app.history.contains(&FileState::RolledBack));
    assert_eq!(app.fix_count, 0);
    assert_eq!(app.code.as_deref(), Some("GOOD = 1"));

    let report = pipeline.finish(true).await.unwrap();
    assert_eq!(report.saved, 1);
    assert_eq!(std::fs::read_to_string(out.join("app.py")).unwrap(), "GOOD = 1");
}

#[tokio::test]
async fn unsafe_content_is_abandoned_after_rewrite_budget() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(|prompt| {
        common_reply(prompt).unwrap_or_else(|| "import os\nos.system('ls')".to_string())
    });
    let sandbox = StubSandbox::always(true);
    let mut cfg = config(dir.path());
    cfg.max_iterations_per_file = 2;
    let out = cfg.output_dir.clone();

    let pipeline = BuildPipeline::start(cfg, &models(&model), sandbox.clone(), None).unwrap();
    let report = pipeline
        .run_build(vec![BuildTask::new("app.py", "List files")], "")
        .await
        .unwrap();

    let app = &report.file_states["app.py"];
    assert_eq!(app.state, FileState::Done);
    assert!(app.abandoned);
    assert!(app.code.is_none());
    assert_eq!(report.generated, 0);
    assert_eq!(report.saved, 0);
    assert!(!report.succeeded());
    assert!(!out.join("app.py").exists());
    // Never reviewed or tested.
    assert_eq!(sandbox.runs(), 0);
    assert!(!model.saw("Please review this code"));

    let rewrites = model
        .prompts()
        .iter()
        .filter(|p| p.contains("contains unsafe patterns"))
        .count();
    assert_eq!(rewrites, 2);
}

fn command_reply(prompt: &str) -> String {
    if prompt.contains("wipe the disk") {
        "sudo rm -rf /".to_string()
    } else if prompt.contains("Write a single shell command") {
        "```bash\necho hello > marker.txt\n```".to_string()
    } else {
        code_reply(prompt)
    }
}

#[tokio::test]
async fn commands_do_not_run_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(command_reply);
    let mut cfg = config(dir.path());
    cfg.safe_commands_allowed = false;
    let out = cfg.output_dir.clone();

    let pipeline = BuildPipeline::start(cfg, &models(&model), StubSandbox::always(true), None).unwrap();
    let record = pipeline
        .request_command("create a marker file", "")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.result.command, "echo hello > marker.txt");
    assert!(!record.result.success);
    assert_eq!(record.result.error, "Command execution disabled");
    assert!(!out.join("marker.txt").exists());

    let report = pipeline.run_build(Vec::new(), "").await.unwrap();
    assert_eq!(report.command_history.len(), 1);
    assert_eq!(report.saved, 0);
}

#[tokio::test]
async fn commands_run_in_the_output_dir_unless_dangerous() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(command_reply);
    let cfg = config(dir.path());
    let out = cfg.output_dir.clone();

    let pipeline = BuildPipeline::start(cfg, &models(&model), StubSandbox::always(true), None).unwrap();
    let record = pipeline
        .request_command("create a marker file", "")
        .await
        .unwrap()
        .unwrap();
    assert!(record.result.success, "{:?}", record.result);
    assert_eq!(std::fs::read_to_string(out.join("marker.txt")).unwrap(), "hello\n");

    let blocked = pipeline
        .request_command("wipe the disk", "")
        .await
        .unwrap()
        .unwrap();
    assert!(!blocked.result.success);
    assert_eq!(blocked.result.error, "Dangerous command blocked for safety");
}

#[tokio::test]
async fn resume_reuses_checkpointed_files() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(code_reply);
    let store = Arc::new(CheckpointStore::in_memory().unwrap());
    let mut cfg = config(dir.path());
    cfg.resume = true;
    cfg.generate_plan = true;
    let out = cfg.output_dir.clone();
    let project = out.display().to_string();

    let mut checkpoint = Checkpoint {
        timestamp: Utc::now(),
        files_completed: vec!["app.py".into()],
        files_pending: vec!["util.py".into()],
        test_results: Default::default(),
        generated_files: Default::default(),
        current_phase: BuildPhase::Generating,
        metadata: Default::default(),
    };
    checkpoint
        .generated_files
        .insert("app.py".into(), "RESTORED = 1".into());
    checkpoint
        .test_results
        .insert("app.py".into(), TestResult { passed: true, ..Default::default() });
    checkpoint.metadata.insert("plan".into(), "# Earlier plan".into());
    store.save(&project, &checkpoint).unwrap();
    assert!(store.recovery_summary(&project).unwrap().can_recover);

    let pipeline =
        BuildPipeline::start(cfg, &models(&model), StubSandbox::always(true), Some(store.clone())).unwrap();
    let report = pipeline
        .run_build(
            vec![BuildTask::new("app.py", "Main"), BuildTask::new("util.py", "Helpers")],
            "",
        )
        .await
        .unwrap();

    assert_eq!(report.saved, 2);
    assert_eq!(std::fs::read_to_string(out.join("app.py")).unwrap(), "RESTORED = 1");
    assert_eq!(report.plan, "# Earlier plan");
    assert!(!model.saw("Create the file 'app.py'"));
    assert!(model.saw("Create the file 'util.py'"));
    assert!(!model.saw("Write a build plan"));

    // A completed build clears its checkpoint.
    assert!(store.load(&project).unwrap().is_none());
    assert_eq!(store.history(&project, "saved").unwrap().len(), 2);
}

#[tokio::test]
async fn validation_requests_complete() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(|prompt| {
        if prompt.contains("has structural errors") {
            "Close the brace on line 1.".to_string()
        } else {
            code_reply(prompt)
        }
    });

    let pipeline =
        BuildPipeline::start(config(dir.path()), &models(&model), StubSandbox::always(true), None).unwrap();
    let ok = pipeline.request_validation("app.js", "function f() { return [1]; }");
    let broken = pipeline.request_validation("broken.js", "function f() {");
    assert!(pipeline.tracker().wait_for_task(&ok, Duration::from_secs(5)).await);
    assert!(pipeline.tracker().wait_for_task(&broken, Duration::from_secs(5)).await);
    assert!(pipeline.wait_for_idle(Duration::from_secs(5)).await);

    assert!(model.saw("'broken.js' has structural errors"));
    assert!(!model.saw("'app.js' has structural errors"));
    // broken.js was never part of a build, so the fix request is ignored.
    assert_eq!(pipeline.file_summary("broken.js").await.unwrap().state, FileState::Init);
}

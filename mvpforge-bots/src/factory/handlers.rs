//! The per-file pipeline: write, screen, review, test, fix or roll back.
//!
//! Each handler takes the file's lock only around state reads and writes,
//! never across a model call or a test run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use mvpforge_sdk::{Handler, Message, Payload};

use super::context::{BuildContext, code_gen_id, review_id, test_gen_id, test_run_id};
use super::state::FileState;
use crate::extract::extract_file_content;
use crate::output::{self, clip};
use crate::request::{BuildTask, Request, TestResult};
use crate::roster::{Persona, Role};
use crate::sandbox::stage_test;

pub(crate) fn unexpected(role: Role, request: &Request) {
    tracing::debug!(agent = %role, kind = request.kind(), "Ignoring unexpected request");
}

/// Where freshly written content came from; decides the review id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    New,
    Fix(u32),
    Iteration(u32),
}

impl Origin {
    fn review_id(self, file: &str) -> String {
        match self {
            Origin::New => review_id(file),
            Origin::Fix(n) => format!("review_{file}_fix_{n}"),
            Origin::Iteration(i) => format!("review_{file}_iter_{i}"),
        }
    }
}

fn code_prompt(task: &BuildTask) -> String {
    format!(
        "Create the file '{file}'.\n\n{description}\n\n\
         Output rules:\n\
         - Return only the file contents: no explanations, no markdown fences, no introductions.\n\
         - Start directly with imports for Python, or <!DOCTYPE html> for HTML.\n\
         - The file must be complete and ready to save as-is.\n\
         - Do not shell out, evaluate strings as code, open sockets, or touch files outside the project.",
        file = task.task,
        description = task.description_or_task(),
    )
}

fn fix_prompt(file: &str, original_code: &str, result: &TestResult, fix_count: u32) -> String {
    format!(
        "Fix '{file}' so its tests pass (fix attempt {fix_count}).\n\n\
         Current code:\n```\n{code}\n```\n\n\
         Test errors:\n{errors}\n\n\
         Test output:\n{out}\n\n\
         Return only the corrected file contents.",
        code = clip(original_code, 2000),
        errors = clip(non_empty(&result.errors), 500),
        out = clip(non_empty(&result.output), 500),
    )
}

fn test_prompt(file: &str, code: &str, review: &str) -> String {
    format!(
        "Write a standalone Python test script for '{file}'.\n\n\
         - Import the module under test by its file name and exercise its public behavior.\n\
         - Exit non-zero (an uncaught assertion is fine) when anything is wrong.\n\
         - No network access, no subprocesses, no writes outside the current directory.\n\
         - For non-Python files, read the file from disk and check its structure.\n\n\
         Code under test:\n```\n{code}\n```\n\n\
         Review notes:\n{review}\n\n\
         Return only the test script.",
        code = clip(code, 1000),
        review = clip(review, 500),
    )
}

fn rollback_prompt(file: &str, result: &TestResult, fix_count: u32, versions: usize, has_passing: bool) -> String {
    format!(
        "'{file}' still fails its tests after {fix_count} fix attempts.\n\n\
         Latest failure:\n{errors}\n\n\
         Saved versions: {versions}. A version that passed its tests {exists}.\n\n\
         Should the file be reverted to the last passing version? Explain briefly, then end \
         with exactly one line: `DECISION: ROLLBACK` or `DECISION: KEEP`.",
        errors = clip(non_empty(&result.errors), 300),
        exists = if has_passing { "exists" } else { "does not exist" },
    )
}

fn non_empty(text: &str) -> &str {
    if text.trim().is_empty() { "N/A" } else { text }
}

/// Whether a rollback assessment asks to revert.
///
/// A `DECISION:` line wins; without one, any mention of rolling back or
/// reverting counts as a yes.
pub fn wants_rollback(assessment: &str) -> bool {
    for line in assessment.lines().rev() {
        let upper = line.trim().trim_matches('`').to_ascii_uppercase();
        if let Some(decision) = upper.strip_prefix("DECISION:") {
            let decision = decision.trim();
            return decision.starts_with("ROLLBACK") || decision.starts_with("REVERT");
        }
    }
    let lower = assessment.to_lowercase();
    lower.contains("rollback") || lower.contains("revert")
}

/// CodeWriter: new files, fixes and improvements.
pub(crate) struct Writer {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

impl Writer {
    async fn generate(&self, task: BuildTask) -> Result<()> {
        let ctx = &self.ctx;
        let file = task.task.clone();
        {
            let mut record = ctx.files.lock(&file).await;
            if record.state != FileState::Init {
                tracing::debug!(file = %file, state = %record.state, "Code request for a file already under way");
                return Ok(());
            }
            record.description = task.description_or_task().to_string();
            record.transition(&file, FileState::Generating);
        }
        ctx.tracker.create_task(&code_gen_id(&file));

        output::status(Role::CodeWriter, "🤖", &format!("Generating {file}"));
        let raw = self.persona.write_code(&code_prompt(&task)).await;
        let code = extract_file_content(&file, &raw);
        output::code(Role::CodeWriter, &file, &code, 20);
        self.accept(&file, code, Origin::New).await
    }

    async fn improve(&self, file: &str, description: &str, iteration: u32, task_id: &str) -> Result<()> {
        let ctx = &self.ctx;
        {
            let mut record = ctx.files.lock(file).await;
            match record.state {
                FileState::Done | FileState::RolledBack => record.transition(file, FileState::Improving),
                FileState::Generating | FileState::Improving => {}
                other => {
                    tracing::debug!(file, state = %other, "Improvement request ignored");
                    ctx.tracker.complete_task(task_id);
                    return Ok(());
                }
            }
        }

        output::status(Role::CodeWriter, "🔧", &format!("Improving {file} (iteration {iteration})"));
        let raw = self.persona.write_code(description).await;
        let code = extract_file_content(file, &raw);
        ctx.tracker.complete_task(task_id);
        self.accept(file, code, Origin::Iteration(iteration)).await
    }

    async fn fix(
        &self,
        file: &str,
        test_result: &TestResult,
        original_code: &str,
        fix_count: u32,
        task_id: &str,
    ) -> Result<()> {
        let ctx = &self.ctx;
        {
            let mut record = ctx.files.lock(file).await;
            if record.state != FileState::Fixing {
                tracing::debug!(file, state = %record.state, "Stale fix request");
                ctx.tracker.complete_task(task_id);
                return Ok(());
            }
            record.transition(file, FileState::Generating);
        }

        output::status(Role::CodeWriter, "🩹", &format!("Fixing {file} (attempt {fix_count})"));
        let raw = self
            .persona
            .write_code(&fix_prompt(file, original_code, test_result, fix_count))
            .await;
        let code = extract_file_content(file, &raw);
        ctx.tracker.complete_task(task_id);
        self.accept(file, code, Origin::Fix(fix_count)).await
    }

    /// Safety gate between writing and review. Unsafe content is sent back
    /// for a rewrite until `max_iterations_per_file` is exhausted.
    async fn accept(&self, file: &str, code: String, origin: Origin) -> Result<()> {
        let ctx = &self.ctx;
        let (safe, violations) = ctx.scanner.scan(file, &code);

        if !safe {
            let attempt = {
                let mut record = ctx.files.lock(file).await;
                record.safety_attempts += 1;
                if record.safety_attempts > ctx.config.max_iterations_per_file {
                    record.abandoned = true;
                    record.transition(file, FileState::Done);
                    None
                } else {
                    Some(record.safety_attempts)
                }
            };
            let Some(attempt) = attempt else {
                output::error(
                    Role::CodeWriter,
                    &format!("Giving up on {file}: content still unsafe ({})", violations.join(", ")),
                );
                ctx.file_finished(file).await;
                return Ok(());
            };

            tracing::warn!(file, attempt, violations = ?violations, "Generated content failed safety scan");
            let task_id = format!("fix_safety_{file}");
            ctx.tracker.create_task(&task_id);
            let description = format!(
                "The generated file '{file}' contains unsafe patterns: {}.\n\
                 Rewrite the file to remove dangerous calls and use safe alternatives.\n\n\
                 Rejected code:\n```\n{}\n```\n\nReturn ONLY the corrected code.",
                violations.join(", "),
                clip(&code, 2000),
            );
            ctx.send(
                Role::CodeWriter,
                Role::CodeWriter,
                Request::ImproveCode {
                    file: file.to_string(),
                    description,
                    iteration: attempt,
                    task_id,
                },
            );
            return Ok(());
        }

        {
            let mut record = ctx.files.lock(file).await;
            record.safety_attempts = 0;
            record.code = Some(code.clone());
            record.save_version(&code, None);
            record.transition(file, FileState::Reviewing);
        }
        if origin == Origin::New {
            ctx.tracker.complete_task(&code_gen_id(file));
        }

        let task_id = origin.review_id(file);
        ctx.tracker.create_task(&task_id);
        ctx.send(
            Role::CodeWriter,
            Role::CodeReviewer,
            Request::Review {
                file: file.to_string(),
                code,
                task_id,
                is_fix: origin != Origin::New,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Handler<Request> for Writer {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        match message.content {
            Request::CodeRequest(task) => self.generate(task).await,
            Request::ImproveCode {
                file,
                description,
                iteration,
                task_id,
            } => self.improve(&file, &description, iteration, &task_id).await,
            Request::FixCode {
                file,
                test_result,
                original_code,
                fix_count,
                task_id,
            } => {
                self.fix(&file, &test_result, &original_code, fix_count, &task_id)
                    .await
            }
            Request::CodeReview { file, review } => {
                self.ctx.files.lock(&file).await.review = Some(review);
                Ok(())
            }
            other => {
                unexpected(Role::CodeWriter, &other);
                Ok(())
            }
        }
    }
}

/// CodeReviewer. Reviews are advisory: every reviewed file moves on to testing.
pub(crate) struct Reviewer {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

impl Reviewer {
    async fn still_reviewing(&self, file: &str, task_id: &str) -> bool {
        let state = self.ctx.files.lock(file).await.state;
        if state != FileState::Reviewing {
            tracing::debug!(file, state = %state, "Stale review request");
            self.ctx.tracker.complete_task(task_id);
            return false;
        }
        true
    }

    async fn review(&self, file: String, code: String, task_id: String, is_fix: bool) -> Result<()> {
        let ctx = &self.ctx;
        if !self.still_reviewing(&file, &task_id).await {
            return Ok(());
        }

        output::status(Role::CodeReviewer, "🔍", &format!("Reviewing {file}{}", if is_fix { " (revision)" } else { "" }));
        let review = self.persona.review_code(&code).await;
        ctx.send(
            Role::CodeReviewer,
            Role::CodeWriter,
            Request::CodeReview {
                file: file.clone(),
                review: review.clone(),
            },
        );

        {
            let mut record = ctx.files.lock(&file).await;
            if record.state != FileState::Reviewing {
                ctx.tracker.complete_task(&task_id);
                return Ok(());
            }
            record.transition(&file, FileState::Testing);
        }
        ctx.tracker.complete_task(&task_id);

        let test_task = test_gen_id(&file);
        ctx.tracker.create_task(&test_task);
        ctx.send(
            Role::CodeReviewer,
            Role::TestGenerator,
            Request::GenerateTest {
                file,
                code,
                review,
                task_id: test_task,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Handler<Request> for Reviewer {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        match message.content {
            Request::Review {
                file,
                code,
                task_id,
                is_fix,
            } => self.review(file, code, task_id, is_fix).await,
            other => {
                unexpected(Role::CodeReviewer, &other);
                Ok(())
            }
        }
    }
}

/// TestGenerator: writes a test script for reviewed code.
pub(crate) struct TestWriter {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

#[async_trait]
impl Handler<Request> for TestWriter {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::GenerateTest {
            file,
            code,
            review,
            task_id,
        } = message.content
        else {
            unexpected(Role::TestGenerator, &message.content);
            return Ok(());
        };
        let ctx = &self.ctx;
        if ctx.files.lock(&file).await.state != FileState::Testing {
            ctx.tracker.complete_task(&task_id);
            return Ok(());
        }

        output::status(Role::TestGenerator, "🧪", &format!("Writing tests for {file}"));
        let raw = self.persona.write_code(&test_prompt(&file, &code, &review)).await;
        let test_code = extract_file_content("test.py", &raw);
        ctx.files.lock(&file).await.test_code = Some(test_code.clone());
        ctx.tracker.complete_task(&task_id);

        let run_task = test_run_id(&file);
        ctx.tracker.create_task(&run_task);
        ctx.send(
            Role::TestGenerator,
            Role::TestRunner,
            Request::RunTest {
                file,
                test_code,
                task_id: run_task,
            },
        );
        Ok(())
    }
}

enum AfterTest {
    Finished,
    Fix(u32),
    Assess(u32),
}

/// TestRunner: runs the test in the sandbox and routes the file on.
pub(crate) struct TestRunner {
    pub ctx: Arc<BuildContext>,
}

impl TestRunner {
    async fn execute(&self, file: &str, code: &str, test_code: &str) -> TestResult {
        let ctx = &self.ctx;
        let staged = {
            let root = ctx.sandbox_path.clone();
            let (file, code, test_code) = (file.to_string(), code.to_string(), test_code.to_string());
            tokio::task::spawn_blocking(move || stage_test(&root, &file, &code, &test_code)).await
        };
        let test_path: PathBuf = match staged {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => return TestResult::failed(format!("{e:#}")),
            Err(e) => return TestResult::failed(e.to_string()),
        };
        match ctx
            .sandbox
            .run(&test_path, &ctx.sandbox_path, ctx.config.test_timeout)
            .await
        {
            Ok(out) => out.into_test_result(),
            Err(e) => TestResult::failed(format!("{e:#}")),
        }
    }

    async fn run(&self, file: String, test_code: String, task_id: String) -> Result<()> {
        let ctx = &self.ctx;
        let code = {
            let record = ctx.files.lock(&file).await;
            if record.state != FileState::Testing {
                tracing::debug!(file = %file, state = %record.state, "Stale test run");
                return Ok(());
            }
            record.code.clone().unwrap_or_default()
        };

        output::status(Role::TestRunner, "▶️", &format!("Running tests for {file}"));
        let result = self.execute(&file, &code, &test_code).await;
        if result.passed {
            output::status(Role::TestRunner, "✅", &format!("Tests passed for {file}"));
        } else {
            output::error(Role::TestRunner, &format!("Tests failed for {file}"));
            tracing::debug!(file = %file, task_id = %task_id, errors = clip(&result.errors, 400), "Test failure");
        }

        let next = {
            let mut record = ctx.files.lock(&file).await;
            record.test_result = Some(result.clone());
            record.save_version(&code, Some(result.clone()));
            if result.passed {
                record.transition(&file, FileState::Done);
                AfterTest::Finished
            } else if record.fix_count >= ctx.config.max_fix_attempts {
                record.transition(&file, FileState::RollbackAssessment);
                AfterTest::Assess(record.fix_count)
            } else {
                record.transition(&file, FileState::Fixing);
                record.fix_count += 1;
                AfterTest::Fix(record.fix_count)
            }
        };

        match next {
            AfterTest::Finished => ctx.file_finished(&file).await,
            AfterTest::Fix(fix_count) => {
                let task_id = format!("fix_{file}_{fix_count}");
                ctx.tracker.create_task(&task_id);
                ctx.send(
                    Role::TestRunner,
                    Role::CodeWriter,
                    Request::FixCode {
                        file,
                        test_result: result,
                        original_code: code,
                        fix_count,
                        task_id,
                    },
                );
            }
            AfterTest::Assess(fix_count) => {
                let task_id = format!("rollback_assess_{file}");
                ctx.tracker.create_task(&task_id);
                ctx.send(
                    Role::TestRunner,
                    Role::RollbackAgent,
                    Request::RollbackAssessment {
                        file,
                        test_result: result,
                        fix_count,
                        task_id,
                    },
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<Request> for TestRunner {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        match message.content {
            Request::RunTest {
                file,
                test_code,
                task_id,
            } => self.run(file, test_code, task_id).await,
            other => {
                unexpected(Role::TestRunner, &other);
                Ok(())
            }
        }
    }
}

/// RollbackAgent: decides whether to restore the last passing version.
pub(crate) struct Rollback {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

impl Rollback {
    async fn assess(&self, file: String, result: TestResult, fix_count: u32, task_id: String) -> Result<()> {
        let ctx = &self.ctx;
        let (last_passing, versions) = {
            let record = ctx.files.lock(&file).await;
            if record.state != FileState::RollbackAssessment {
                ctx.tracker.complete_task(&task_id);
                return Ok(());
            }
            (record.last_passing_version().cloned(), record.versions.len())
        };

        output::status(Role::RollbackAgent, "⏪", &format!("Assessing rollback for {file}"));
        let assessment = self
            .persona
            .generate_response(&rollback_prompt(&file, &result, fix_count, versions, last_passing.is_some()))
            .await;
        let revert = wants_rollback(&assessment);
        ctx.tracker.complete_task(&task_id);

        {
            let mut record = ctx.files.lock(&file).await;
            if record.state != FileState::RollbackAssessment {
                return Ok(());
            }
            match last_passing {
                Some(version) if revert => {
                    let exec_task = format!("rollback_exec_{file}");
                    ctx.tracker.create_task(&exec_task);
                    record.code = Some(version.code.clone());
                    record.save_version(
                        &version.code,
                        Some(TestResult {
                            passed: true,
                            output: format!("restored from version {}", version.index),
                            errors: String::new(),
                        }),
                    );
                    record.transition(&file, FileState::RolledBack);
                    record.fix_count = 0;
                    record.transition(&file, FileState::Done);
                    ctx.tracker.complete_task(&exec_task);
                    tracing::info!(file = %file, version = version.index, "Rolled back to last passing version");
                }
                _ => {
                    tracing::info!(
                        file = %file,
                        has_passing = last_passing.is_some(),
                        revert,
                        "Keeping current version"
                    );
                    record.transition(&file, FileState::Done);
                }
            }
        }
        ctx.file_finished(&file).await;
        Ok(())
    }
}

#[async_trait]
impl Handler<Request> for Rollback {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        match message.content {
            Request::RollbackAssessment {
                file,
                test_result,
                fix_count,
                task_id,
            } => self.assess(file, test_result, fix_count, task_id).await,
            other => {
                unexpected(Role::RollbackAgent, &other);
                Ok(())
            }
        }
    }
}

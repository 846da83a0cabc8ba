//! Adaptive builds: infer the file list from a product description, then
//! run the normal build pipeline on it.

mod parse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mvpforge_sdk::{Handler, Message, wait_for_completion};

pub use parse::parse_task_response;

use crate::config::AdaptiveConfig;
use crate::error::BuildError;
use crate::factory::{BuildContext, BuildPipeline, BuildReport, unexpected};
use crate::memory::CheckpointStore;
use crate::output::{self, clip};
use crate::request::{BuildTask, Request};
use crate::roster::{ModelSet, Persona, Role};
use crate::sandbox::Sandbox;

pub const INFER_TASK: &str = "infer_build_tasks";
const IDEATION_POLL: Duration = Duration::from_millis(500);

fn ideation_prompt(
    description: &str,
    target_platform: &str,
    tech_preferences: &[(String, String)],
    min_files: usize,
    max_files: usize,
) -> String {
    let preferences = if tech_preferences.is_empty() {
        "none".to_string()
    } else {
        tech_preferences
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Analyze this product idea and break it down into concrete build tasks.\n\n\
         PRODUCT DESCRIPTION:\n{description}\n\n\
         TARGET PLATFORM: {target_platform}\n\
         TECH PREFERENCES:\n{preferences}\n\n\
         For each file give its path (use templates/ or static/ for web assets), a detailed \
         description of what it must contain, and how it integrates with the other files. \
         Consider backend, frontend, data handling, external services, error handling and tests.\n\n\
         Generate {min_files} to {max_files} files that form a complete, working MVP.\n\n\
         Return ONLY a JSON array in this format:\n\
         ```json\n\
         [\n  {{\"task\": \"app.py\", \"description\": \"...\", \"priority\": 1, \"type\": \"backend\"}},\n  \
         {{\"task\": \"templates/index.html\", \"description\": \"...\", \"priority\": 2, \"type\": \"frontend\"}}\n]\n\
         ```"
    )
}

/// IdeationAgent: one model call per inference request. The raw reply is
/// kept on the build context for the caller to parse.
pub(crate) struct Ideation {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

#[async_trait]
impl Handler<Request> for Ideation {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::InferTasks {
            description,
            target_platform,
            tech_preferences,
            min_files,
            max_files,
            task_id,
        } = message.content
        else {
            unexpected(Role::IdeationAgent, &message.content);
            return Ok(());
        };

        output::status(Role::IdeationAgent, "🧠", "Breaking the idea down into files");
        let response = self
            .persona
            .generate_response(&ideation_prompt(
                &description,
                &target_platform,
                &tech_preferences,
                min_files,
                max_files,
            ))
            .await;
        *self.ctx.ideation.lock() = Some(response);
        self.ctx.tracker.complete_task(&task_id);
        Ok(())
    }
}

/// Description in, built project out.
pub struct AdaptiveBuildPipeline {
    config: AdaptiveConfig,
    pipeline: BuildPipeline,
}

impl AdaptiveBuildPipeline {
    pub fn start(
        config: AdaptiveConfig,
        models: &ModelSet,
        sandbox: Arc<dyn Sandbox>,
        checkpoints: Option<Arc<CheckpointStore>>,
    ) -> Result<Self> {
        let pipeline = BuildPipeline::start(config.build.clone(), models, sandbox, checkpoints)?;
        Ok(Self { config, pipeline })
    }

    pub fn pipeline(&self) -> &BuildPipeline {
        &self.pipeline
    }

    /// Ask the ideation agent for a file list. Returns the tasks (at most
    /// `max_files`) and the raw reply.
    pub async fn infer_build_tasks(&self, description: &str) -> Result<(Vec<BuildTask>, String), BuildError> {
        let ctx = self.pipeline.context();
        ctx.tracker.create_task(INFER_TASK);
        ctx.send(
            Role::Coordinator,
            Role::IdeationAgent,
            Request::InferTasks {
                description: description.to_string(),
                target_platform: self.config.target_platform.clone(),
                tech_preferences: self
                    .config
                    .tech_preferences
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                min_files: self.config.min_files,
                max_files: self.config.max_files,
                task_id: INFER_TASK.to_string(),
            },
        );

        let ideation = [self.pipeline.agent(Role::IdeationAgent)];
        let answered = wait_for_completion(
            &ideation,
            Some(&ctx.tracker),
            &[INFER_TASK.to_string()],
            self.config.ideation_timeout,
            IDEATION_POLL,
        )
        .await;
        if !answered {
            tracing::warn!(
                timeout_secs = self.config.ideation_timeout.as_secs(),
                "Ideation did not answer in time"
            );
        }

        let response = ctx.ideation.lock().take().unwrap_or_default();
        let mut tasks = parse_task_response(&response);
        if tasks.is_empty() {
            return Err(BuildError::NoTasksInferred {
                preview: clip(&response, 500).to_string(),
            });
        }
        if tasks.len() > self.config.max_files {
            tracing::warn!(
                inferred = tasks.len(),
                max = self.config.max_files,
                "Too many files inferred; keeping the first ones"
            );
            tasks.truncate(self.config.max_files);
        }
        if tasks.len() < self.config.min_files {
            tracing::warn!(inferred = tasks.len(), min = self.config.min_files, "Fewer files than requested");
        }
        for (i, task) in tasks.iter().enumerate() {
            tracing::info!(
                n = i + 1,
                file = %task.task,
                kind = task.kind.as_deref().unwrap_or("unknown"),
                "Inferred file"
            );
        }
        Ok((tasks, response))
    }

    /// Infer the file list, then build it.
    pub async fn run_adaptive_build(self, description: &str) -> Result<BuildReport> {
        let (tasks, analysis) = self.infer_build_tasks(description).await?;
        let mut report = self.pipeline.run_build(tasks.clone(), description).await?;
        report.inferred_tasks = tasks;
        report.project_analysis = analysis;
        Ok(report)
    }
}

//! Agents around the per-file pipeline: planning, shell commands,
//! iteration and validation.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use mvpforge_sdk::{Handler, Message};

use super::context::BuildContext;
use super::handlers::unexpected;
use crate::extract::extract_file_content;
use crate::llm::is_error_response;
use crate::output::{self, clip};
use crate::request::{BuildTask, Request, TestResult};
use crate::roster::{Persona, Role};
use crate::tools::{CommandRecord, CommandResult, execute_command_safe};

/// PlannerAgent: one markdown plan per build.
pub(crate) struct Planner {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

fn plan_prompt(description: &str, tasks: &[BuildTask]) -> String {
    let files = tasks
        .iter()
        .map(|t| format!("- {}: {}", t.task, clip(t.description_or_task(), 200)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Write a build plan in markdown for this project.\n\n\
         Project: {description}\n\nFiles:\n{files}\n\n\
         Cover objectives, which agent handles what, ordering, methodology, \
         workflow and risk mitigation. Keep it under one page."
    )
}

#[async_trait]
impl Handler<Request> for Planner {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::GeneratePlan {
            project_description,
            build_tasks,
            task_id,
        } = message.content
        else {
            unexpected(Role::Planner, &message.content);
            return Ok(());
        };

        output::status(Role::Planner, "📋", "Writing build plan");
        let plan = self
            .persona
            .generate_response(&plan_prompt(&project_description, &build_tasks))
            .await;
        if is_error_response(&plan) || plan.trim().is_empty() {
            output::error(Role::Planner, "No plan produced");
        } else {
            *self.ctx.plan.lock() = Some(plan.trim().to_string());
        }
        self.ctx.tracker.complete_task(&task_id);
        Ok(())
    }
}

/// CommandGenerator: task description in, one shell command out.
pub(crate) struct CommandWriter {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

#[async_trait]
impl Handler<Request> for CommandWriter {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::GenerateCommand {
            task_description,
            context,
            working_dir,
            task_id,
        } = message.content
        else {
            unexpected(Role::CommandGenerator, &message.content);
            return Ok(());
        };
        let ctx = &self.ctx;

        let prompt = format!(
            "Write a single shell command for: {task_description}\n\n\
             Working directory: {}\nContext: {}\n\n\
             Output only the command, no explanation and no markdown.",
            working_dir.display(),
            if context.trim().is_empty() { "none" } else { &context },
        );
        let raw = self.persona.generate_response(&prompt).await;
        let command = extract_file_content("command.sh", &raw).trim().to_string();

        if is_error_response(&raw) || command.is_empty() {
            output::error(Role::CommandGenerator, &format!("No command for: {task_description}"));
            ctx.commands.lock().push(CommandRecord {
                task: task_description,
                result: CommandResult {
                    error: "No command generated".to_string(),
                    ..Default::default()
                },
                timestamp: chrono::Utc::now(),
            });
            ctx.tracker.complete_task(&task_id);
            return Ok(());
        }

        output::status(Role::CommandGenerator, "💻", &command);
        // The executor completes `task_id`.
        ctx.send(
            Role::CommandGenerator,
            Role::CommandExecutor,
            Request::ExecuteCommand {
                command,
                task_description,
                working_dir,
                task_id,
            },
        );
        Ok(())
    }
}

/// CommandExecutor: runs generated commands when the build allows it.
pub(crate) struct CommandRunner {
    pub ctx: Arc<BuildContext>,
}

#[async_trait]
impl Handler<Request> for CommandRunner {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::ExecuteCommand {
            command,
            task_description,
            working_dir,
            task_id,
        } = message.content
        else {
            unexpected(Role::CommandExecutor, &message.content);
            return Ok(());
        };
        let ctx = &self.ctx;

        let result = if ctx.config.safe_commands_allowed {
            execute_command_safe(&command, &working_dir, ctx.config.command_timeout).await
        } else {
            tracing::info!(command = %command, "Command execution disabled; not running");
            CommandResult {
                command: command.clone(),
                error: "Command execution disabled".to_string(),
                ..Default::default()
            }
        };
        if result.success {
            output::status(Role::CommandExecutor, "✅", &format!("Ran: {command}"));
        } else {
            output::error(Role::CommandExecutor, &format!("{command}: {}", clip(&result.error, 200)));
        }

        ctx.commands.lock().push(CommandRecord {
            task: task_description,
            result,
            timestamp: chrono::Utc::now(),
        });
        ctx.tracker.complete_task(&task_id);
        Ok(())
    }
}

/// IterationAgent: turns a test outcome into an improvement request.
pub(crate) struct Iteration {
    pub ctx: Arc<BuildContext>,
}

fn iteration_prompt(file: &str, code: &str, result: &TestResult, iteration: u32) -> String {
    format!(
        "Improve '{file}' (iteration {iteration}).\n\n\
         Current code:\n```\n{code}\n```\n\n\
         Latest test {status}. Errors:\n{errors}\n\n\
         Return ONLY the improved file contents.",
        code = clip(code, 2000),
        status = if result.passed { "passed" } else { "failed" },
        errors = clip(if result.errors.is_empty() { "none" } else { &result.errors }, 500),
    )
}

#[async_trait]
impl Handler<Request> for Iteration {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::Iterate {
            file,
            test_result,
            iteration,
            task_id,
        } = message.content
        else {
            unexpected(Role::IterationAgent, &message.content);
            return Ok(());
        };
        let ctx = &self.ctx;

        let code = ctx.files.lock(&file).await.code.clone().unwrap_or_default();
        let improve_id = format!("improve_{file}_iter_{iteration}");
        ctx.tracker.create_task(&improve_id);
        output::status(Role::IterationAgent, "🔁", &format!("Iteration {iteration} for {file}"));
        ctx.send(
            Role::IterationAgent,
            Role::CodeWriter,
            Request::ImproveCode {
                description: iteration_prompt(&file, &code, &test_result, iteration),
                file,
                iteration,
                task_id: improve_id,
            },
        );
        ctx.tracker.complete_task(&task_id);
        Ok(())
    }
}

/// Cheap structural problems in `code`: JSON that does not parse, or
/// unbalanced brackets outside strings and comments. Markup and unknown
/// file types are not checked.
pub fn check_structure(file: &str, code: &str) -> Vec<String> {
    let ext = Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "json" => match serde_json::from_str::<serde_json::Value>(code) {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("invalid JSON: {e}")],
        },
        "py" | "sh" => check_delimiters(code, Comments::Hash),
        "js" | "jsx" | "ts" | "tsx" | "css" | "rs" | "go" | "java" | "c" | "cpp" | "h" => {
            check_delimiters(code, Comments::Slash)
        }
        _ => Vec::new(),
    }
}

#[derive(Clone, Copy)]
enum Comments {
    Hash,
    Slash,
}

fn check_delimiters(code: &str, comments: Comments) -> Vec<String> {
    let mut errors = Vec::new();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut chars = code.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '#' if matches!(comments, Comments::Hash) => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '/' if matches!(comments, Comments::Slash) && chars.peek() == Some(&'/') => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '/' if matches!(comments, Comments::Slash) && chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if n == '\n' {
                        line += 1;
                    }
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            '"' | '\'' | '`' => {
                let quote = c;
                let mut escaped = false;
                for n in chars.by_ref() {
                    if n == '\n' {
                        line += 1;
                        if quote != '`' && !escaped {
                            // Unterminated single-line string; resync at the newline.
                            break;
                        }
                    }
                    if escaped {
                        escaped = false;
                    } else if n == '\\' {
                        escaped = true;
                    } else if n == quote {
                        break;
                    }
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((o, _)) if o == open => {}
                    Some((o, at)) => {
                        errors.push(format!("line {line}: '{c}' closes '{o}' opened on line {at}"));
                    }
                    None => errors.push(format!("line {line}: unmatched '{c}'")),
                }
            }
            _ => {}
        }
    }
    for (open, at) in stack {
        errors.push(format!("line {at}: '{open}' is never closed"));
    }
    errors
}

/// ValidationAgent: structural check, then a fix request when needed.
pub(crate) struct Validation {
    pub ctx: Arc<BuildContext>,
    pub persona: Arc<Persona>,
}

#[async_trait]
impl Handler<Request> for Validation {
    async fn handle(&self, message: Message<Request>) -> Result<()> {
        let Request::ValidateCode { file, code, task_id } = message.content else {
            unexpected(Role::ValidationAgent, &message.content);
            return Ok(());
        };
        let ctx = &self.ctx;

        let errors = check_structure(&file, &code);
        if errors.is_empty() {
            output::status(Role::ValidationAgent, "✅", &format!("{file} looks structurally sound"));
            ctx.tracker.complete_task(&task_id);
            return Ok(());
        }

        output::error(Role::ValidationAgent, &format!("{file}: {}", errors.join("; ")));
        let strategy = self
            .persona
            .generate_response(&format!(
                "'{file}' has structural errors:\n{}\n\nCode:\n```\n{}\n```\n\n\
                 Describe precisely how to fix them.",
                errors.join("\n"),
                clip(&code, 2000),
            ))
            .await;

        let fix_id = format!("fix_validation_{file}");
        ctx.tracker.create_task(&fix_id);
        ctx.send(
            Role::ValidationAgent,
            Role::CodeWriter,
            Request::ImproveCode {
                description: format!(
                    "Fix the structural errors in '{file}':\n{}\n\nSuggested fix:\n{}\n\n\
                     Current code:\n```\n{}\n```\n\nReturn ONLY the corrected file contents.",
                    errors.join("\n"),
                    clip(&strategy, 1000),
                    clip(&code, 2000),
                ),
                file,
                iteration: 0,
                task_id: fix_id,
            },
        );
        ctx.tracker.complete_task(&task_id);
        Ok(())
    }
}

//! Messages exchanged between build agents.

use std::path::PathBuf;

use mvpforge_sdk::Payload;
use serde::{Deserialize, Deserializer, Serialize};

/// One file to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    /// Path relative to the output directory; unique within a build.
    pub task: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl BuildTask {
    pub fn new(task: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            description: description.into(),
            priority: None,
            kind: None,
        }
    }

    /// The description, or the file name when none was given.
    pub fn description_or_task(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.task
        } else {
            &self.description
        }
    }
}

/// Accept `1`, `"1"`, or `"high"`/`"medium"`/`"low"`; anything else is no priority.
fn lenient_priority<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(1),
            "medium" => Some(2),
            "low" => Some(3),
            other => other.parse().ok(),
        },
        _ => None,
    })
}

/// Outcome of running a generated test in the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub output: String,
    pub errors: String,
}

impl TestResult {
    pub fn failed(errors: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: String::new(),
            errors: errors.into(),
        }
    }
}

/// Every message kind the build agents understand.
#[derive(Debug, Clone)]
pub enum Request {
    /// Coordinator asks the writer for a new file.
    CodeRequest(BuildTask),
    /// Rewrite an existing file from a free-form description.
    ImproveCode {
        file: String,
        description: String,
        iteration: u32,
        task_id: String,
    },
    /// Rewrite a file after a failing test run.
    FixCode {
        file: String,
        test_result: TestResult,
        original_code: String,
        fix_count: u32,
        task_id: String,
    },
    Review {
        file: String,
        code: String,
        task_id: String,
        is_fix: bool,
    },
    /// Reviewer feedback delivered back to the author.
    CodeReview { file: String, review: String },
    GenerateTest {
        file: String,
        code: String,
        review: String,
        task_id: String,
    },
    RunTest {
        file: String,
        test_code: String,
        task_id: String,
    },
    RollbackAssessment {
        file: String,
        test_result: TestResult,
        fix_count: u32,
        task_id: String,
    },
    GenerateCommand {
        task_description: String,
        context: String,
        working_dir: PathBuf,
        task_id: String,
    },
    ExecuteCommand {
        command: String,
        task_description: String,
        working_dir: PathBuf,
        task_id: String,
    },
    GeneratePlan {
        project_description: String,
        build_tasks: Vec<BuildTask>,
        task_id: String,
    },
    Iterate {
        file: String,
        test_result: TestResult,
        iteration: u32,
        task_id: String,
    },
    ValidateCode {
        file: String,
        code: String,
        task_id: String,
    },
    InferTasks {
        description: String,
        target_platform: String,
        tech_preferences: Vec<(String, String)>,
        min_files: usize,
        max_files: usize,
        task_id: String,
    },
}

impl Request {
    /// The file this request is about, if any.
    pub fn file(&self) -> Option<&str> {
        match self {
            Request::CodeRequest(task) => Some(&task.task),
            Request::ImproveCode { file, .. }
            | Request::FixCode { file, .. }
            | Request::Review { file, .. }
            | Request::CodeReview { file, .. }
            | Request::GenerateTest { file, .. }
            | Request::RunTest { file, .. }
            | Request::RollbackAssessment { file, .. }
            | Request::Iterate { file, .. }
            | Request::ValidateCode { file, .. } => Some(file),
            Request::GenerateCommand { .. }
            | Request::ExecuteCommand { .. }
            | Request::GeneratePlan { .. }
            | Request::InferTasks { .. } => None,
        }
    }
}

impl Payload for Request {
    fn kind(&self) -> &'static str {
        match self {
            Request::CodeRequest(_) => "code_request",
            Request::ImproveCode { .. } => "improve_code_request",
            Request::FixCode { .. } => "fix_code_request",
            Request::Review { .. } => "review_request",
            Request::CodeReview { .. } => "code_review",
            Request::GenerateTest { .. } => "generate_test_request",
            Request::RunTest { .. } => "run_test_request",
            Request::RollbackAssessment { .. } => "rollback_assessment_request",
            Request::GenerateCommand { .. } => "generate_command_request",
            Request::ExecuteCommand { .. } => "execute_command_request",
            Request::GeneratePlan { .. } => "generate_plan_request",
            Request::Iterate { .. } => "iterate_request",
            Request::ValidateCode { .. } => "validate_code_request",
            Request::InferTasks { .. } => "infer_tasks_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_task_from_ideation_json() {
        let tasks: Vec<BuildTask> = serde_json::from_str(
            r#"[
                {"task": "app.py", "description": "Flask app", "priority": 1, "type": "backend"},
                {"task": "templates/index.html", "priority": "high"},
                {"task": "static/app.js", "priority": "soon"}
            ]"#,
        )
        .unwrap();
        assert_eq!(tasks[0].kind.as_deref(), Some("backend"));
        assert_eq!(tasks[0].priority, Some(1));
        assert_eq!(tasks[1].priority, Some(1));
        assert_eq!(tasks[1].description_or_task(), "templates/index.html");
        assert_eq!(tasks[2].priority, None);
    }

    #[test]
    fn test_kind_and_file() {
        let req = Request::CodeRequest(BuildTask::new("app.py", "x"));
        assert_eq!(req.kind(), "code_request");
        assert_eq!(req.file(), Some("app.py"));

        let req = Request::GeneratePlan {
            project_description: "todo".into(),
            build_tasks: vec![],
            task_id: "generate_plan".into(),
        };
        assert_eq!(req.kind(), "generate_plan_request");
        assert_eq!(req.file(), None);
    }
}

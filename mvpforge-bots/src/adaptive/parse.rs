//! Recover a task list from a free-form model reply.

use crate::request::BuildTask;

/// Parse the ideation reply into build tasks.
///
/// Tried in order: a ```json fenced array, the first balanced top-level
/// `[...]`, then everything between the outermost brackets with trailing
/// commas removed. Entries without a `task` are dropped. Empty when nothing
/// parses.
pub fn parse_task_response(response: &str) -> Vec<BuildTask> {
    let attempts = [fenced_json(response), balanced_array(response), salvage(response)];
    for candidate in attempts.into_iter().flatten() {
        if let Some(tasks) = parse_tasks(&candidate) {
            return tasks;
        }
    }
    Vec::new()
}

fn parse_tasks(json: &str) -> Option<Vec<BuildTask>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(json).ok()?;
    Some(
        values
            .into_iter()
            .filter_map(|v| serde_json::from_value::<BuildTask>(v).ok())
            .filter(|t| !t.task.trim().is_empty())
            .collect(),
    )
}

fn fenced_json(response: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?s)```json\s*(\[.*?\])\s*```").ok()?;
    re.captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// The first `[` and its matching `]`, skipping brackets inside strings.
fn balanced_array(response: &str) -> Option<String> {
    let start = response.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in response[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn salvage(response: &str) -> Option<String> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }
    let body = &response[start..=end];
    let objects = regex::Regex::new(r",\s*}").ok()?;
    let arrays = regex::Regex::new(r",\s*]").ok()?;
    let body = objects.replace_all(body, "}");
    Some(arrays.replace_all(&body, "]").into_owned())
}

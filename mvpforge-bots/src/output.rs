//! Progress lines and the end-of-build summary.
//!
//! Agents report through `tracing` with their role as a field; only the CLI
//! prints the final summary to stdout.

use crate::factory::{BuildReport, FileState};
use crate::roster::Role;

/// One-line status update from an agent.
pub fn status(role: Role, icon: &str, text: &str) {
    tracing::info!(agent = %role, "{icon} {text}");
}

pub fn error(role: Role, text: &str) {
    tracing::warn!(agent = %role, "❌ {text}");
}

/// Log the head of a code artifact at debug level.
pub fn code(role: Role, filename: &str, content: &str, max_lines: usize) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let lines: Vec<&str> = content.lines().collect();
    tracing::debug!(agent = %role, file = filename, lines = lines.len(), "📄 {filename}");
    for line in lines.iter().take(max_lines) {
        tracing::debug!(agent = %role, file = filename, "  {line}");
    }
    if lines.len() > max_lines {
        tracing::debug!(agent = %role, file = filename, "  ... ({} more lines)", lines.len() - max_lines);
    }
}

/// At most `max_chars` characters of `text`.
pub fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Wrap text into lines of max_len, breaking on word boundaries.
pub fn wrap_lines(text: &str, max_len: usize) -> Vec<String> {
    let mut result = Vec::new();
    for line in text.lines() {
        if line.len() <= max_len {
            result.push(line.to_string());
        } else {
            let mut current = String::new();
            for word in line.split_whitespace() {
                if current.len() + word.len() + 1 > max_len {
                    if !current.is_empty() {
                        result.push(current);
                    }
                    current = word.to_string();
                } else {
                    if !current.is_empty() {
                        current.push(' ');
                    }
                    current.push_str(word);
                }
            }
            if !current.is_empty() {
                result.push(current);
            }
        }
    }
    result
}

fn state_icon(state: FileState, passed: bool) -> &'static str {
    match state {
        FileState::Done if passed => "✅",
        FileState::Done | FileState::RolledBack => "⚠️",
        _ => "⏳",
    }
}

/// Human-readable summary of a finished build.
pub fn render_report(report: &BuildReport) -> String {
    let mut out = Vec::new();
    out.push(format!(
        "Build {}: {} generated, {} saved",
        if report.completed { "finished" } else { "timed out" },
        report.generated,
        report.saved
    ));

    for (file, summary) in &report.file_states {
        let passed = summary.test_result.as_ref().is_some_and(|r| r.passed);
        let mut line = format!(
            "  {} {file} [{}] fixes={} versions={}",
            state_icon(summary.state, passed),
            summary.state,
            summary.fix_count,
            summary.versions
        );
        if summary.history.contains(&FileState::RolledBack) {
            line.push_str(" (rolled back)");
        }
        if summary.abandoned {
            line.push_str(" (unsafe output, not saved)");
        }
        out.push(line);
    }

    if !report.command_history.is_empty() {
        out.push(format!("Commands ({}):", report.command_history.len()));
        for record in &report.command_history {
            let mark = if record.result.success { "ok" } else { "failed" };
            out.push(format!("  [{mark}] {}", record.result.command));
        }
    }

    if !report.plan.is_empty() {
        out.push("Plan:".to_string());
        for line in wrap_lines(clip(&report.plan, 600), 100).into_iter().take(8) {
            out.push(format!("  {line}"));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), "hé");
        assert_eq!(clip("abc", 10), "abc");
    }

    #[test]
    fn test_wrap_lines() {
        let wrapped = wrap_lines("one two three four", 9);
        assert_eq!(wrapped, vec!["one two", "three", "four"]);
    }

    #[test]
    fn test_render_empty_report() {
        let report = BuildReport::default();
        let text = render_report(&report);
        assert!(text.starts_with("Build timed out: 0 generated, 0 saved"));
    }
}

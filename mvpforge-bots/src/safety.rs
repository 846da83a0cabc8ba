//! Static screen for dangerous constructs in generated code.
//!
//! A plain substring scan with no side effects. It runs before content is
//! reviewed, tested or written to disk.

/// Snippets that are never allowed in generated files (matched case-insensitively).
pub const BANNED_SNIPPETS: &[&str] = &[
    "import os",
    "import subprocess",
    "from subprocess import",
    "os.system(",
    "subprocess.run(",
    "subprocess.Popen(",
    "import shlex",
    "import socket",
    "import paramiko",
    "shutil.rmtree(",
    "open('/etc",
    "open(\"/etc",
    "import ctypes",
    "ctypes.CDLL(",
    "eval(",
    "exec(",
];

const NETWORK_PREFIXES: &[&str] = &["requests.", "httpx.", "urllib."];

#[derive(Debug, Clone, Default)]
pub struct SafetyScanner {
    extra_banned: Vec<String>,
}

impl SafetyScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also reject `snippet`.
    pub fn ban(mut self, snippet: impl Into<String>) -> Self {
        self.extra_banned.push(snippet.into());
        self
    }

    /// Returns `(is_safe, violations)`. Empty content is safe.
    pub fn scan(&self, filename: &str, content: &str) -> (bool, Vec<String>) {
        if content.is_empty() {
            return (true, Vec::new());
        }
        let lower = content.to_lowercase();
        let mut violations = Vec::new();

        let banned = BANNED_SNIPPETS
            .iter()
            .copied()
            .chain(self.extra_banned.iter().map(String::as_str));
        for snippet in banned {
            if !lower.contains(&snippet.to_lowercase()) {
                continue;
            }
            let violation = format!("found '{snippet}'");
            if !violations.contains(&violation) {
                violations.push(violation);
            }
        }

        if content.contains("open(") && (lower.contains("/tmp/") || content.contains("..")) {
            violations.push("suspicious file access (open with /tmp or parent traversal)".to_string());
        }

        if filename.ends_with(".py") && NETWORK_PREFIXES.iter().any(|p| lower.contains(p)) {
            violations.push("networking libraries used in app code".to_string());
        }

        (violations.is_empty(), violations)
    }
}

/// Scan with the default rules.
pub fn scan(filename: &str, content: &str) -> (bool, Vec<String>) {
    SafetyScanner::new().scan(filename, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_code_is_safe_and_stays_safe() {
        let code = "from flask import Flask\napp = Flask(__name__)\n";
        assert_eq!(scan("app.py", code), (true, vec![]));
        // Deterministic on repeat.
        assert_eq!(scan("app.py", code), (true, vec![]));
        assert!(scan("app.py", "").0);
    }

    #[test]
    fn test_shell_and_eval_are_flagged() {
        let (safe, violations) = scan("app.py", "import subprocess\nsubprocess.run(['ls'])\nEVAL(x)");
        assert!(!safe);
        assert!(violations.contains(&"found 'import subprocess'".to_string()));
        assert!(violations.contains(&"found 'subprocess.run('".to_string()));
        assert!(violations.contains(&"found 'eval('".to_string()));
    }

    #[test]
    fn test_file_access_and_networking() {
        let (safe, violations) = scan("app.py", "data = open('../secrets').read()");
        assert!(!safe);
        assert_eq!(violations.len(), 1);

        let (safe, _) = scan("app.py", "r = requests.get(url)");
        assert!(!safe);
        // Networking is only banned in Python sources.
        assert!(scan("static/app.js", "fetch(url).then(r => r.json())").0);
    }

    #[test]
    fn test_extra_banned() {
        let scanner = SafetyScanner::new().ban("pickle.loads(");
        let (safe, violations) = scanner.scan("app.py", "pickle.loads(blob)");
        assert!(!safe);
        assert_eq!(violations, vec!["found 'pickle.loads('".to_string()]);
    }
}

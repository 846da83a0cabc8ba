//! Scripted models and stub sandboxes for end-to-end builds.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use mvpforge_bots::config::BuildConfig;
use mvpforge_bots::llm::{Exchange, LanguageModel};
use mvpforge_bots::roster::ModelSet;
use mvpforge_bots::sandbox::{ExecOutput, Sandbox};

type Reply = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Answers each prompt with a closure and records every prompt it saw.
pub struct ScriptedModel {
    reply: Reply,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(reply: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.prompts.lock().iter().any(|p| p.contains(needle))
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _system: &str, _history: &[Exchange]) -> String {
        self.prompts.lock().push(prompt.to_string());
        (self.reply)(prompt)
    }
}

pub fn models(model: &Arc<ScriptedModel>) -> ModelSet {
    ModelSet::uniform(model.clone())
}

/// Replies for the prompts every build sends besides code.
pub fn common_reply(prompt: &str) -> Option<String> {
    if prompt.contains("Write a standalone Python test script") {
        Some("```python\nassert True\n```".to_string())
    } else if prompt.contains("Please review this code") {
        Some("Looks reasonable.".to_string())
    } else if prompt.contains("Write a build plan") {
        Some("# Plan\n\n1. Write the files.\n2. Test them.".to_string())
    } else if prompt.contains("still fails its tests") {
        Some("Nothing better to go back to.\nDECISION: KEEP".to_string())
    } else {
        None
    }
}

/// Decides pass/fail from the staged sandbox directory.
pub struct StubSandbox {
    verdict: Box<dyn Fn(&Path) -> bool + Send + Sync>,
    runs: Mutex<usize>,
}

impl StubSandbox {
    pub fn new(verdict: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            verdict: Box::new(verdict),
            runs: Mutex::new(0),
        })
    }

    pub fn always(pass: bool) -> Arc<Self> {
        Self::new(move |_| pass)
    }

    /// Pass when the staged `file` contains `needle`.
    pub fn when_contains(file: &'static str, needle: &'static str) -> Arc<Self> {
        Self::new(move |dir| {
            std::fs::read_to_string(dir.join(file))
                .map(|code| code.contains(needle))
                .unwrap_or(false)
        })
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock()
    }
}

#[async_trait]
impl Sandbox for StubSandbox {
    async fn run(&self, file: &Path, working_dir: &Path, _timeout: Duration) -> Result<ExecOutput> {
        assert!(file.exists(), "test script was not staged");
        *self.runs.lock() += 1;
        let passed = (self.verdict)(working_dir);
        Ok(ExecOutput {
            exit_code: Some(if passed { 0 } else { 1 }),
            stdout: String::new(),
            stderr: if passed {
                String::new()
            } else {
                "AssertionError: stub failure".to_string()
            },
            timed_out: false,
        })
    }
}

/// Fast settings: no stagger, short polls, no plan, no git.
pub fn config(root: &Path) -> BuildConfig {
    let mut cfg = BuildConfig::new(root.join("out"));
    cfg.dispatch_stagger = Duration::ZERO;
    cfg.poll_interval = Duration::from_millis(50);
    cfg.timeout = Duration::from_secs(20);
    cfg.plan_timeout = Duration::from_secs(5);
    cfg.test_timeout = Duration::from_secs(5);
    cfg.command_timeout = Duration::from_secs(10);
    cfg.generate_plan = false;
    cfg.enable_git = false;
    cfg
}

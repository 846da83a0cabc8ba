//! The fixed roster of build agents.
//!
//! Every role gets a mailbox ([`Agent`]); roles that think also get a
//! [`Persona`]: a model, a role system prompt and a short memory of recent
//! exchanges.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use mvpforge_sdk::{Agent, MessageBus};
use parking_lot::Mutex;

use crate::config::{ForgeConfig, ModelTask};
use crate::llm::{Exchange, LanguageModel, LlmClient, OfflineModel, is_error_response};
use crate::request::Request;

/// Exchanges a persona replays to its model.
pub const HISTORY_LIMIT: usize = 5;

/// Prepended to every role's system prompt.
pub const CORE_DIRECTIVE: &str = "Be direct and terse. No emojis, filler, hype, or conversational \
transitions. Do not ask questions or offer follow-ups. Deliver the requested artifact and stop.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Coordinator,
    Planner,
    CodeWriter,
    CodeReviewer,
    TestGenerator,
    TestRunner,
    RollbackAgent,
    CommandGenerator,
    CommandExecutor,
    IterationAgent,
    ValidationAgent,
    IdeationAgent,
}

impl Role {
    pub const ALL: [Role; 12] = [
        Role::Coordinator,
        Role::Planner,
        Role::CodeWriter,
        Role::CodeReviewer,
        Role::TestGenerator,
        Role::TestRunner,
        Role::RollbackAgent,
        Role::CommandGenerator,
        Role::CommandExecutor,
        Role::IterationAgent,
        Role::ValidationAgent,
        Role::IdeationAgent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::Coordinator => "BuildCoordinator",
            Role::Planner => "PlannerAgent",
            Role::CodeWriter => "CodeWriter",
            Role::CodeReviewer => "CodeReviewer",
            Role::TestGenerator => "TestGenerator",
            Role::TestRunner => "TestRunner",
            Role::RollbackAgent => "RollbackAgent",
            Role::CommandGenerator => "CommandGenerator",
            Role::CommandExecutor => "CommandExecutor",
            Role::IterationAgent => "IterationAgent",
            Role::ValidationAgent => "ValidationAgent",
            Role::IdeationAgent => "IdeationAgent",
        }
    }

    /// Which configured model this role talks to. `None` for roles that
    /// never call a model.
    pub fn model_task(self) -> Option<ModelTask> {
        match self {
            Role::Planner => Some(ModelTask::Planning),
            Role::CodeWriter => Some(ModelTask::CodeGeneration),
            Role::CodeReviewer | Role::ValidationAgent => Some(ModelTask::CodeReview),
            Role::TestGenerator => Some(ModelTask::TestGeneration),
            Role::RollbackAgent => Some(ModelTask::Rollback),
            Role::CommandGenerator => Some(ModelTask::Commands),
            Role::IdeationAgent => Some(ModelTask::Ideation),
            Role::Coordinator | Role::TestRunner | Role::CommandExecutor | Role::IterationAgent => None,
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            Role::Planner => {
                "You are an expert project planner. Produce markdown plans with objectives, agent \
                 assignments, timeline, locations, methodology, workflow and risk mitigation."
            }
            Role::CodeWriter => {
                "You are an expert software developer. Write clean, efficient, complete code that \
                 is ready to save to disk as-is."
            }
            Role::CodeReviewer => {
                "You are an expert code reviewer. Identify bugs, integration problems and unsafe \
                 constructs. Give clear, actionable feedback."
            }
            Role::TestGenerator => {
                "You are an expert test engineer. Write standalone Python test scripts that exit \
                 non-zero on failure and are safe to run in a sandbox."
            }
            Role::RollbackAgent => {
                "You decide whether a file that keeps failing its tests should be reverted to its \
                 last passing version. Weigh the failure against the work lost."
            }
            Role::CommandGenerator => {
                "You write safe zsh/bash commands for macOS and Linux. Output only the command."
            }
            Role::ValidationAgent => {
                "You validate code correctness and describe precise fixes for any errors found."
            }
            Role::IdeationAgent => {
                "You are a startup architect and product designer. Break product ideas into \
                 concrete files, each with a detailed implementation brief. Think about \
                 architecture, data flow and integration points."
            }
            Role::Coordinator | Role::TestRunner | Role::CommandExecutor | Role::IterationAgent => "",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which model serves which task.
#[derive(Clone)]
pub struct ModelSet {
    fallback: Arc<dyn LanguageModel>,
    by_task: HashMap<ModelTask, Arc<dyn LanguageModel>>,
}

impl ModelSet {
    /// One model for every role.
    pub fn uniform(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            fallback: model,
            by_task: HashMap::new(),
        }
    }

    pub fn with(mut self, task: ModelTask, model: Arc<dyn LanguageModel>) -> Self {
        self.by_task.insert(task, model);
        self
    }

    /// Claude clients per configured model name, or the offline model when
    /// no API key is available.
    pub fn from_config(config: &ForgeConfig) -> Self {
        let Some(api_key) = config.resolve_api_key() else {
            tracing::warn!("No API key; using the offline model for every agent");
            return Self::uniform(Arc::new(OfflineModel::default()));
        };

        let mut clients: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        let mut set = Self::uniform(Arc::new(
            LlmClient::new(api_key.clone()).with_model(config.model_for(ModelTask::CodeGeneration)),
        ));
        for task in [
            ModelTask::CodeGeneration,
            ModelTask::CodeReview,
            ModelTask::TestGeneration,
            ModelTask::Planning,
            ModelTask::Ideation,
            ModelTask::Rollback,
            ModelTask::Commands,
        ] {
            let name = config.model_for(task).to_string();
            let client = clients
                .entry(name.clone())
                .or_insert_with(|| Arc::new(LlmClient::new(api_key.clone()).with_model(&name)))
                .clone();
            set = set.with(task, client);
        }
        set
    }

    pub fn for_task(&self, task: ModelTask) -> Arc<dyn LanguageModel> {
        self.by_task
            .get(&task)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A role bound to a model, with a bounded conversation history.
pub struct Persona {
    role: Role,
    model: Arc<dyn LanguageModel>,
    system: String,
    history: Mutex<VecDeque<Exchange>>,
}

impl Persona {
    pub fn new(role: Role, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            role,
            model,
            system: format!("{CORE_DIRECTIVE}\n\n{}", role.system_prompt()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Ask the model, replaying recent exchanges. Failed calls come back as
    /// error text and are not remembered.
    pub async fn generate_response(&self, prompt: &str) -> String {
        let history: Vec<Exchange> = self.history.lock().iter().cloned().collect();
        tracing::debug!(agent = %self.role, model = self.model.name(), "Calling model");
        let response = self.model.generate(prompt, &self.system, &history).await;

        if !is_error_response(&response) {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(Exchange {
                prompt: prompt.to_string(),
                response: response.clone(),
            });
        }
        response
    }

    pub async fn write_code(&self, requirement: &str) -> String {
        self.generate_response(&format!(
            "Write code for: {requirement}\n\nProvide complete, working code."
        ))
        .await
    }

    pub async fn review_code(&self, code: &str) -> String {
        self.generate_response(&format!(
            "Please review this code and provide feedback:\n\n```\n{code}\n```"
        ))
        .await
    }
}

/// Mailboxes and personas for every role.
pub struct Roster {
    agents: HashMap<Role, Arc<Agent<Request>>>,
    personas: HashMap<Role, Arc<Persona>>,
}

impl Roster {
    pub fn new(models: &ModelSet) -> Self {
        let mut agents = HashMap::new();
        let mut personas = HashMap::new();
        for role in Role::ALL {
            agents.insert(role, Agent::new(role.name()));
            if let Some(task) = role.model_task() {
                personas.insert(role, Arc::new(Persona::new(role, models.for_task(task))));
            }
        }
        Self { agents, personas }
    }

    pub fn agent(&self, role: Role) -> Arc<Agent<Request>> {
        // Every role is populated in `new`.
        self.agents[&role].clone()
    }

    pub fn persona(&self, role: Role) -> Option<Arc<Persona>> {
        self.personas.get(&role).cloned()
    }

    /// All agents in roster order.
    pub fn agents(&self) -> Vec<Arc<Agent<Request>>> {
        Role::ALL.iter().map(|role| self.agent(*role)).collect()
    }

    pub fn register(&self, bus: &MessageBus<Request>) {
        for agent in self.agents() {
            bus.register(&agent);
        }
    }

    pub fn stop_all(&self) {
        for agent in self.agents.values() {
            agent.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes how many history entries it was given.
    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn generate(&self, _prompt: &str, system: &str, history: &[Exchange]) -> String {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                assert!(system.starts_with(CORE_DIRECTIVE));
            }
            format!("history={}", history.len())
        }
    }

    #[tokio::test]
    async fn test_persona_history_is_bounded() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let persona = Persona::new(Role::CodeWriter, model);
        for _ in 0..7 {
            persona.write_code("app.py").await;
        }
        assert_eq!(persona.history_len(), HISTORY_LIMIT);
        assert_eq!(persona.generate_response("again").await, "history=5");
    }

    #[test]
    fn test_roster_has_every_role() {
        let roster = Roster::new(&ModelSet::uniform(Arc::new(OfflineModel::default())));
        assert_eq!(roster.agents().len(), Role::ALL.len());
        assert!(roster.persona(Role::CodeWriter).is_some());
        assert!(roster.persona(Role::TestRunner).is_none());

        let bus = MessageBus::new();
        roster.register(&bus);
        assert_eq!(bus.len(), Role::ALL.len());
    }

    #[test]
    fn test_offline_without_api_key() {
        let mut cfg = ForgeConfig::default();
        cfg.api_key = None;
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        let set = ModelSet::from_config(&cfg);
        assert_eq!(set.for_task(ModelTask::Ideation).name(), "offline");
    }
}

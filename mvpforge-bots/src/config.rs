//! Configuration for mvpforge.
//!
//! `ForgeConfig` is the persistent, user-level config
//! (`~/.config/mvpforge/config.toml`, overridable with `--config`), with
//! `MVPFORGE_<SECTION>_<KEY>` environment overrides on top. A `BuildConfig`
//! is derived from it per build and passed down explicitly; nothing reads
//! configuration from global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;

pub const APP_DIR: &str = "mvpforge";
pub const ENV_PREFIX: &str = "MVPFORGE_";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const FAST_MODEL: &str = "claude-3-5-haiku-20241022";

/// Which job a model is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTask {
    CodeGeneration,
    CodeReview,
    TestGeneration,
    Planning,
    Ideation,
    Rollback,
    Commands,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub code_generation: String,
    pub code_review: String,
    pub test_generation: String,
    pub planning: String,
    pub ideation: String,
    pub rollback: String,
    pub commands: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            code_generation: DEFAULT_MODEL.to_string(),
            code_review: FAST_MODEL.to_string(),
            test_generation: FAST_MODEL.to_string(),
            planning: DEFAULT_MODEL.to_string(),
            ideation: DEFAULT_MODEL.to_string(),
            rollback: FAST_MODEL.to_string(),
            commands: FAST_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub max_fix_attempts: u32,
    pub max_iterations_per_file: u32,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub enable_git: bool,
    pub generate_plan: bool,
    pub safe_commands_allowed: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_fix_attempts: 3,
            max_iterations_per_file: 5,
            timeout_secs: 600,
            poll_interval_ms: 1000,
            enable_git: true,
            generate_plan: true,
            safe_commands_allowed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathSettings {
    /// Where the checkpoint database lives. Default: the platform data dir.
    pub state_dir: Option<PathBuf>,
}

/// User configuration (persisted in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForgeConfig {
    /// Anthropic API key. ANTHROPIC_API_KEY takes precedence.
    pub api_key: Option<String>,
    pub models: ModelConfig,
    pub build: BuildSettings,
    pub paths: PathSettings,
}

/// Result of [`ForgeConfig::validate`].
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl ForgeConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        if !path.exists() {
            if explicit {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Bad config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `MVPFORGE_<SECTION>_<KEY>=value` overrides. Values are parsed as
    /// TOML literals when possible (`5`, `true`), otherwise taken as strings.
    /// `MVPFORGE_API_KEY` sets the top-level key. Unknown keys are ignored.
    pub fn apply_overrides<I>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = toml::Value::try_from(&self)?;
        let Some(table) = root.as_table_mut() else {
            return Ok(self);
        };
        let mut changed = false;

        for (name, raw) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = rest.to_ascii_lowercase();
            if key == "api_key" {
                table.insert(key, toml::Value::String(raw));
                changed = true;
                continue;
            }
            let Some((section, field)) = key.split_once('_') else {
                continue;
            };
            let Some(section_table) = table.get_mut(section).and_then(|v| v.as_table_mut()) else {
                tracing::debug!(var = %name, "Ignoring unknown config section");
                continue;
            };
            let known = section_table.contains_key(field)
                || (section == "paths" && field == "state_dir");
            if !known {
                tracing::debug!(var = %name, "Ignoring unknown config key");
                continue;
            }
            section_table.insert(field.to_string(), parse_env_value(&raw));
            changed = true;
        }

        if !changed {
            return Ok(self);
        }
        root.try_into()
            .map_err(|e| BuildError::InvalidConfig(format!("environment override: {e}")).into())
    }

    /// API key: environment first, then the config file.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.trim().is_empty()))
    }

    pub fn model_for(&self, task: ModelTask) -> &str {
        let m = &self.models;
        match task {
            ModelTask::CodeGeneration => &m.code_generation,
            ModelTask::CodeReview => &m.code_review,
            ModelTask::TestGeneration => &m.test_generation,
            ModelTask::Planning => &m.planning,
            ModelTask::Ideation => &m.ideation,
            ModelTask::Rollback => &m.rollback,
            ModelTask::Commands => &m.commands,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.resolve_api_key().is_none() {
            report
                .warnings
                .push("No Anthropic API key configured; agents will use the offline model".into());
        }
        for (name, model) in [
            ("code_generation", &self.models.code_generation),
            ("code_review", &self.models.code_review),
            ("ideation", &self.models.ideation),
        ] {
            if model.trim().is_empty() {
                report.issues.push(format!("No model configured for {name}"));
            }
        }
        if self.build.max_fix_attempts > 20 {
            report
                .issues
                .push("build.max_fix_attempts must be between 0 and 20".into());
        }
        if self.build.max_iterations_per_file == 0 {
            report
                .issues
                .push("build.max_iterations_per_file must be at least 1".into());
        }
        if self.build.timeout_secs == 0 {
            report.issues.push("build.timeout_secs must be positive".into());
        }
        report
    }

    /// Per-build settings seeded from this config.
    pub fn build_config(&self, output_dir: impl Into<PathBuf>) -> BuildConfig {
        let mut cfg = BuildConfig::new(output_dir);
        cfg.max_fix_attempts = self.build.max_fix_attempts;
        cfg.max_iterations_per_file = self.build.max_iterations_per_file;
        cfg.timeout = Duration::from_secs(self.build.timeout_secs);
        cfg.poll_interval = Duration::from_millis(self.build.poll_interval_ms);
        cfg.enable_git = self.build.enable_git;
        cfg.generate_plan = self.build.generate_plan;
        cfg.safe_commands_allowed = self.build.safe_commands_allowed;
        cfg
    }
}

fn parse_env_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Settings for one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub output_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_fix_attempts: u32,
    /// Ceiling on safety rewrites for a single file.
    pub max_iterations_per_file: u32,
    /// When false, generated shell commands are never executed.
    pub safe_commands_allowed: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub generate_plan: bool,
    pub enable_git: bool,
    /// Pause between successive code requests.
    pub dispatch_stagger: Duration,
    pub plan_timeout: Duration,
    pub test_timeout: Duration,
    pub command_timeout: Duration,
    /// Reuse files completed by an interrupted build of the same output dir.
    pub resume: bool,
}

impl BuildConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            templates_dir: output_dir.join("templates"),
            static_dir: output_dir.join("static"),
            output_dir,
            max_fix_attempts: 3,
            max_iterations_per_file: 5,
            safe_commands_allowed: true,
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            generate_plan: true,
            enable_git: false,
            dispatch_stagger: Duration::from_secs(3),
            plan_timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            resume: false,
        }
    }
}

/// Settings for an adaptive (description-driven) build.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub build: BuildConfig,
    pub ideation_timeout: Duration,
    pub min_files: usize,
    pub max_files: usize,
    pub target_platform: String,
    pub tech_preferences: BTreeMap<String, String>,
}

impl AdaptiveConfig {
    pub fn new(build: BuildConfig) -> Self {
        Self {
            build,
            ideation_timeout: Duration::from_secs(60),
            min_files: 2,
            max_files: 10,
            target_platform: "macOS".to_string(),
            tech_preferences: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ForgeConfig::default();
        assert_eq!(cfg.build.max_fix_attempts, 3);
        assert_eq!(cfg.model_for(ModelTask::Planning), DEFAULT_MODEL);

        let build = BuildConfig::new("/tmp/out");
        assert_eq!(build.templates_dir, PathBuf::from("/tmp/out/templates"));
        assert_eq!(build.static_dir, PathBuf::from("/tmp/out/static"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = ForgeConfig::parse(
            r#"
            [build]
            max_fix_attempts = 1

            [models]
            ideation = "claude-opus"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.build.max_fix_attempts, 1);
        assert_eq!(cfg.build.timeout_secs, 600);
        assert_eq!(cfg.model_for(ModelTask::Ideation), "claude-opus");
        assert_eq!(cfg.model_for(ModelTask::CodeReview), FAST_MODEL);
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("MVPFORGE_BUILD_MAX_FIX_ATTEMPTS".to_string(), "5".to_string()),
            ("MVPFORGE_BUILD_ENABLE_GIT".to_string(), "false".to_string()),
            ("MVPFORGE_MODELS_CODE_REVIEW".to_string(), "my-model".to_string()),
            ("MVPFORGE_PATHS_STATE_DIR".to_string(), "/var/forge".to_string()),
            ("MVPFORGE_NOPE_THING".to_string(), "1".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let cfg = ForgeConfig::default().apply_overrides(vars).unwrap();
        assert_eq!(cfg.build.max_fix_attempts, 5);
        assert!(!cfg.build.enable_git);
        assert_eq!(cfg.models.code_review, "my-model");
        assert_eq!(cfg.state_dir(), PathBuf::from("/var/forge"));
    }

    #[test]
    fn test_bad_env_override_is_an_error() {
        let vars = vec![(
            "MVPFORGE_BUILD_MAX_FIX_ATTEMPTS".to_string(),
            "lots".to_string(),
        )];
        assert!(ForgeConfig::default().apply_overrides(vars).is_err());
    }

    #[test]
    fn test_validate_flags_out_of_range_values() {
        let mut cfg = ForgeConfig::default();
        assert!(cfg.validate().is_valid());
        cfg.build.max_fix_attempts = 99;
        cfg.models.ideation = String::new();
        let report = cfg.validate();
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_build_config_from_forge_config() {
        let mut cfg = ForgeConfig::default();
        cfg.build.timeout_secs = 42;
        cfg.build.enable_git = false;
        let build = cfg.build_config("out");
        assert_eq!(build.timeout, Duration::from_secs(42));
        assert!(!build.enable_git);
        assert_eq!(build.max_fix_attempts, 3);
    }
}

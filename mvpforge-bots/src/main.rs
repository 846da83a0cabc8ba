//! mvpforge: build a small application with a team of LLM agents.
//!
//!   mvpforge build --task app.py="Flask app" --task templates/index.html="Landing page"
//!   mvpforge build --tasks-json tasks.json
//!   mvpforge adapt "A habit tracker with streaks" --prefer framework=Flask
//!   mvpforge status
//!
//! Uses ANTHROPIC_API_KEY when set; without a key every agent runs offline.
//! Exits non-zero unless at least one file was saved.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use mvpforge_bots::config::{AdaptiveConfig, BuildConfig, ForgeConfig};
use mvpforge_bots::memory::CheckpointStore;
use mvpforge_bots::output;
use mvpforge_bots::roster::ModelSet;
use mvpforge_bots::sandbox::PythonSandbox;
use mvpforge_bots::{AdaptiveBuildPipeline, BuildPipeline, BuildReport, BuildTask};

const CHECKPOINT_DB: &str = "checkpoints.db";

#[derive(Parser)]
#[command(name = "mvpforge", about = "Build small apps with a team of LLM agents")]
struct Cli {
    /// Config file (default: ~/.config/mvpforge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Anthropic API key (or set ANTHROPIC_API_KEY)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Use this model for every agent
    #[arg(long, global = true)]
    model: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Print the build report as JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a fixed list of files
    Build {
        /// FILE=DESCRIPTION; repeat for more files
        #[arg(long = "task", value_name = "FILE=DESCRIPTION")]
        tasks: Vec<String>,

        /// JSON array of {"task", "description"} objects
        #[arg(long)]
        tasks_json: Option<PathBuf>,

        /// Project description for the plan
        #[arg(long, default_value = "")]
        description: String,

        #[command(flatten)]
        build: BuildArgs,
    },
    /// Infer the files from a product description, then build them
    Adapt {
        description: String,

        #[arg(long, default_value = "macOS")]
        platform: String,

        /// KEY=VALUE technology preference; repeat for more
        #[arg(long = "prefer", value_name = "KEY=VALUE")]
        preferences: Vec<String>,

        #[arg(long, default_value_t = 2)]
        min_files: usize,

        #[arg(long, default_value_t = 10)]
        max_files: usize,

        /// Seconds to wait for the file list
        #[arg(long, default_value_t = 60)]
        ideation_timeout: u64,

        #[command(flatten)]
        build: BuildArgs,
    },
    /// Show the recoverable checkpoint for an output directory and check the config
    Status {
        #[arg(long, default_value = "output")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Output directory
    #[arg(long, default_value = "output")]
    output: PathBuf,

    #[arg(long)]
    templates_dir: Option<PathBuf>,

    #[arg(long)]
    static_dir: Option<PathBuf>,

    #[arg(long)]
    max_fix_attempts: Option<u32>,

    /// Ceiling on safety rewrites per file
    #[arg(long)]
    max_iterations_per_file: Option<u32>,

    /// Overall build timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Seconds between code requests
    #[arg(long)]
    stagger: Option<u64>,

    #[arg(long)]
    no_plan: bool,

    #[arg(long, conflicts_with = "no_git")]
    git: bool,

    #[arg(long)]
    no_git: bool,

    /// Never execute generated shell commands
    #[arg(long)]
    no_commands: bool,

    /// Reuse files finished by an interrupted build of the same output directory
    #[arg(long)]
    resume: bool,

    /// Have the command agents run this before building; repeatable
    #[arg(long = "command", value_name = "DESCRIPTION")]
    commands: Vec<String>,

    /// Python interpreter for generated tests
    #[arg(long, default_value = "python3")]
    python: String,
}

impl BuildArgs {
    fn build_config(&self, forge: &ForgeConfig) -> BuildConfig {
        let mut cfg = forge.build_config(&self.output);
        if let Some(dir) = &self.templates_dir {
            cfg.templates_dir = dir.clone();
        }
        if let Some(dir) = &self.static_dir {
            cfg.static_dir = dir.clone();
        }
        if let Some(n) = self.max_fix_attempts {
            cfg.max_fix_attempts = n;
        }
        if let Some(n) = self.max_iterations_per_file {
            cfg.max_iterations_per_file = n;
        }
        if let Some(secs) = self.timeout {
            cfg.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval_ms {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.stagger {
            cfg.dispatch_stagger = Duration::from_secs(secs);
        }
        if self.no_plan {
            cfg.generate_plan = false;
        }
        if self.git {
            cfg.enable_git = true;
        }
        if self.no_git {
            cfg.enable_git = false;
        }
        if self.no_commands {
            cfg.safe_commands_allowed = false;
        }
        cfg.resume = self.resume;
        cfg
    }
}

fn split_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("empty key in {raw:?}");
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn load_tasks(pairs: &[String], json: Option<&Path>) -> Result<Vec<BuildTask>> {
    let mut tasks = Vec::new();
    if let Some(path) = json {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: Vec<BuildTask> =
            serde_json::from_str(&text).with_context(|| format!("Invalid task list in {}", path.display()))?;
        tasks.extend(parsed);
    }
    for pair in pairs {
        let (file, description) = split_pair(pair)?;
        tasks.push(BuildTask::new(file, description));
    }
    if tasks.is_empty() {
        anyhow::bail!("nothing to build: pass --task FILE=DESCRIPTION or --tasks-json");
    }
    Ok(tasks)
}

fn open_checkpoints(forge: &ForgeConfig) -> Option<Arc<CheckpointStore>> {
    let path = forge.state_dir().join(CHECKPOINT_DB);
    match CheckpointStore::open(&path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Checkpoints disabled");
            None
        }
    }
}

async fn run_commands(pipeline: &BuildPipeline, commands: &[String]) -> Result<()> {
    for description in commands {
        match pipeline.request_command(description, "").await? {
            Some(record) if record.result.success => {
                tracing::info!(command = %record.result.command, "Command succeeded");
            }
            Some(record) => {
                tracing::warn!(command = %record.result.command, error = %record.result.error, "Command failed");
            }
            None => tracing::warn!(task = %description, "No command result"),
        }
    }
    Ok(())
}

fn print_report(report: &BuildReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", output::render_report(report));
    }
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mvpforge_bots=info,mvpforge_sdk=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let mut forge = ForgeConfig::load(cli.config.as_deref())?.apply_env()?;
    if let Some(key) = cli.api_key {
        forge.api_key = Some(key);
    }
    if let Some(model) = &cli.model {
        let m = &mut forge.models;
        for slot in [
            &mut m.code_generation,
            &mut m.code_review,
            &mut m.test_generation,
            &mut m.planning,
            &mut m.ideation,
            &mut m.rollback,
            &mut m.commands,
        ] {
            slot.clone_from(model);
        }
    }

    let report = forge.validate();
    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    if !report.is_valid() {
        for issue in &report.issues {
            tracing::error!("{issue}");
        }
        anyhow::bail!("invalid configuration");
    }

    match cli.command {
        Command::Status { output } => {
            let Some(store) = open_checkpoints(&forge) else {
                println!("No checkpoint store available");
                return Ok(true);
            };
            let summary = store.recovery_summary(&output.display().to_string())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else if summary.can_recover {
                println!(
                    "Recoverable build in {}: {} done, {} pending, phase {}, {}s old",
                    output.display(),
                    summary.files_completed,
                    summary.files_pending,
                    summary.current_phase.map(|p| p.to_string()).unwrap_or_default(),
                    summary.age_seconds
                );
            } else {
                println!("Nothing to recover for {}", output.display());
            }
            Ok(true)
        }
        Command::Build {
            tasks,
            tasks_json,
            description,
            build,
        } => {
            let tasks = load_tasks(&tasks, tasks_json.as_deref())?;
            let models = ModelSet::from_config(&forge);
            let sandbox = Arc::new(PythonSandbox::new(build.python.clone()));
            let pipeline = BuildPipeline::start(
                build.build_config(&forge),
                &models,
                sandbox,
                open_checkpoints(&forge),
            )?;
            run_commands(&pipeline, &build.commands).await?;

            let description = if description.trim().is_empty() {
                tasks.iter().map(|t| t.task.as_str()).collect::<Vec<_>>().join(", ")
            } else {
                description
            };
            let report = pipeline.run_build(tasks, &description).await?;
            print_report(&report, cli.json)?;
            Ok(report.succeeded())
        }
        Command::Adapt {
            description,
            platform,
            preferences,
            min_files,
            max_files,
            ideation_timeout,
            build,
        } => {
            let mut config = AdaptiveConfig::new(build.build_config(&forge));
            config.target_platform = platform;
            config.min_files = min_files;
            config.max_files = max_files.max(1);
            config.ideation_timeout = Duration::from_secs(ideation_timeout);
            for pair in &preferences {
                let (key, value) = split_pair(pair)?;
                config.tech_preferences.insert(key, value);
            }

            let models = ModelSet::from_config(&forge);
            let sandbox = Arc::new(PythonSandbox::new(build.python.clone()));
            let adaptive = AdaptiveBuildPipeline::start(config, &models, sandbox, open_checkpoints(&forge))?;
            run_commands(adaptive.pipeline(), &build.commands).await?;
            let report = adaptive.run_adaptive_build(&description).await?;
            print_report(&report, cli.json)?;
            Ok(report.succeeded())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pair() {
        assert_eq!(
            split_pair("templates/index.html=Landing page = hero").unwrap(),
            ("templates/index.html".to_string(), "Landing page = hero".to_string())
        );
        assert!(split_pair("no-separator").is_err());
        assert!(split_pair("=value").is_err());
    }

    #[test]
    fn test_load_tasks_requires_something() {
        assert!(load_tasks(&[], None).is_err());
        let tasks = load_tasks(&["app.py=Flask app".to_string()], None).unwrap();
        assert_eq!(tasks[0].task, "app.py");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "mvpforge",
            "build",
            "--task",
            "app.py=hello",
            "--max-fix-attempts",
            "0",
            "--no-commands",
        ])
        .unwrap();
        let Command::Build { build, .. } = cli.command else {
            panic!("expected build");
        };
        let cfg = build.build_config(&ForgeConfig::default());
        assert_eq!(cfg.max_fix_attempts, 0);
        assert!(!cfg.safe_commands_allowed);
        assert_eq!(cfg.templates_dir, PathBuf::from("output").join("templates"));
    }
}

//! mvpforge-bots: LLM agents that build small applications file by file.
//!
//! - [`factory`]: the multi-agent build pipeline and its per-file state machine
//! - [`adaptive`]: infer the file list from a product description, then build
//! - [`roster`]: the fixed set of agent roles and their models
//! - [`memory`]: SQLite checkpoints for interrupted builds

pub mod adaptive;
pub mod config;
pub mod error;
pub mod extract;
pub mod factory;
pub mod git;
pub mod llm;
pub mod memory;
pub mod output;
pub mod request;
pub mod roster;
pub mod safety;
pub mod sandbox;
pub mod tools;

pub use adaptive::AdaptiveBuildPipeline;
pub use config::{AdaptiveConfig, BuildConfig, ForgeConfig};
pub use error::BuildError;
pub use factory::{BuildPipeline, BuildReport, FileState};
pub use request::{BuildTask, Request, TestResult};

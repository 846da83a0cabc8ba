//! Multi-agent build pipeline.
//!
//! Every file moves through its own state machine:
//!
//! ```text
//! init → generating → reviewing → testing → done
//! testing (failed, fixes left) → fixing → generating
//! testing (failed, no fixes left) → rollback_assessment → rolled_back → done
//!                                                       → done
//! generating (unsafe content) → generating, bounded, then done without content
//! done → improving → reviewing (iteration and validation requests)
//! ```
//!
//! Agent roles:
//! - Coordinator: dispatches code requests and waits for the files to settle
//! - Planner: writes the build plan
//! - CodeWriter: writes, fixes and improves files; screens them for unsafe content
//! - CodeReviewer, TestGenerator, TestRunner: review, test and route each file
//! - RollbackAgent: restores the last passing version when fixes run out
//! - CommandGenerator/CommandExecutor, IterationAgent, ValidationAgent: on request

mod context;
mod handlers;
mod orchestrator;
mod state;
mod support;

pub(crate) use context::BuildContext;
pub use context::{PLAN_TASK, code_gen_id, review_id, test_gen_id, test_run_id, tracked_ids};
pub(crate) use handlers::unexpected;
pub use handlers::wants_rollback;
pub use orchestrator::{BuildPipeline, BuildReport};
pub use state::{FileState, FileSummary, FileVersion};
pub use support::check_structure;

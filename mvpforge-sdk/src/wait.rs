//! Polling helpers for detecting when a group of agents has finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agent::Agent;
use crate::message::Payload;
use crate::tracker::TaskTracker;

/// Grace period after the tracked ids complete, for trailing handler work.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

const PROGRESS_EVERY: Duration = Duration::from_secs(2);

fn all_idle<T: Payload>(agents: &[Arc<Agent<T>>]) -> bool {
    agents.iter().all(|agent| agent.is_idle())
}

/// Poll until `agent` has nothing queued or in flight.
pub async fn wait_for_queue_empty<T: Payload>(
    agent: &Agent<T>,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if agent.is_idle() {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Poll until every agent is idle, confirmed by a short second look.
pub async fn wait_for_agents_idle<T: Payload>(
    agents: &[Arc<Agent<T>>],
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if all_idle(agents) {
            tokio::time::sleep(SETTLE_DELAY).await;
            if all_idle(agents) {
                return true;
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Wait for a workflow to finish.
///
/// Done when either every id in `task_ids` is complete in `tracker`, or every
/// agent's mailbox stays empty across one extra polling tick. The second
/// check covers handlers that never complete a tracked id. Returns false on
/// timeout.
pub async fn wait_for_completion<T: Payload>(
    agents: &[Arc<Agent<T>>],
    tracker: Option<&TaskTracker>,
    task_ids: &[String],
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let start = Instant::now();
    let mut last_progress = Duration::ZERO;

    while start.elapsed() < timeout {
        if let Some(tracker) = tracker
            && !task_ids.is_empty()
        {
            let done = tracker.completed_count(task_ids);
            let elapsed = start.elapsed();
            if elapsed.saturating_sub(last_progress) > PROGRESS_EVERY {
                tracing::info!(done, total = task_ids.len(), "Waiting for tasks");
                last_progress = elapsed;
            }
            if done == task_ids.len() {
                tokio::time::sleep(SETTLE_DELAY).await;
                return true;
            }
        }

        if all_idle(agents) {
            tokio::time::sleep(poll_interval).await;
            if all_idle(agents) {
                tracing::debug!("All mailboxes empty");
                return true;
            }
        }

        tokio::time::sleep(poll_interval).await;
    }

    tracing::warn!(timeout_secs = timeout.as_secs_f64(), "Timed out waiting for completion");
    false
}

//! Named completion events.
//!
//! Handlers create a task id when they hand work off and complete it when
//! the work lands; anyone can wait on one id or a set of ids. Waiting never
//! fails: a timeout or an unknown id is simply `false`.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task_id` as not yet complete. Re-creating an existing id
    /// resets it; current waiters keep waiting for the new completion.
    pub fn create_task(&self, task_id: &str) {
        let mut tasks = self.tasks.lock();
        match tasks.get(task_id) {
            Some(tx) => {
                tx.send_replace(false);
            }
            None => {
                let (tx, _rx) = watch::channel(false);
                tasks.insert(task_id.to_string(), tx);
            }
        }
        tracing::trace!(task_id, "Task created");
    }

    /// Signal `task_id`. Unknown ids are ignored; returns whether it was known.
    pub fn complete_task(&self, task_id: &str) -> bool {
        match self.tasks.lock().get(task_id) {
            Some(tx) => {
                tx.send_replace(true);
                tracing::trace!(task_id, "Task completed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.lock().contains_key(task_id)
    }

    pub fn is_complete(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .get(task_id)
            .map(|tx| *tx.borrow())
            .unwrap_or(false)
    }

    pub fn completed_count(&self, task_ids: &[String]) -> usize {
        let tasks = self.tasks.lock();
        task_ids
            .iter()
            .filter(|id| tasks.get(id.as_str()).map(|tx| *tx.borrow()).unwrap_or(false))
            .count()
    }

    pub fn all_complete(&self, task_ids: &[String]) -> bool {
        self.completed_count(task_ids) == task_ids.len()
    }

    /// Wait until `task_id` completes. False on timeout or unknown id.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> bool {
        let Some(mut rx) = self.tasks.lock().get(task_id).map(|tx| tx.subscribe()) else {
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }

    /// Wait for every id, each bounded by `timeout`. True only if all completed.
    pub async fn wait_for_all(&self, task_ids: &[String], timeout: Duration) -> bool {
        let waits = task_ids.iter().map(|id| self.wait_for_task(id, timeout));
        futures::future::join_all(waits).await.into_iter().all(|ok| ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_returns_once_completed() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.create_task("code_gen_app.py");

        let t = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.complete_task("code_gen_app.py");
        });

        assert!(
            tracker
                .wait_for_task("code_gen_app.py", Duration::from_secs(2))
                .await
        );
        assert!(tracker.is_complete("code_gen_app.py"));
    }

    #[tokio::test]
    async fn test_timeout_and_unknown_ids_are_false() {
        let tracker = TaskTracker::new();
        tracker.create_task("slow");
        assert!(!tracker.wait_for_task("slow", Duration::from_millis(20)).await);
        assert!(!tracker.wait_for_task("nope", Duration::from_millis(20)).await);
        assert!(!tracker.complete_task("nope"));
    }

    #[tokio::test]
    async fn test_recreate_resets_completion() {
        let tracker = TaskTracker::new();
        tracker.create_task("review_app.py");
        tracker.complete_task("review_app.py");
        assert!(tracker.is_complete("review_app.py"));

        tracker.create_task("review_app.py");
        assert!(!tracker.is_complete("review_app.py"));
        assert!(
            !tracker
                .wait_for_task("review_app.py", Duration::from_millis(20))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_all() {
        let tracker = TaskTracker::new();
        let ids: Vec<String> = vec!["a".into(), "b".into()];
        for id in &ids {
            tracker.create_task(id);
        }
        tracker.complete_task("a");
        assert_eq!(tracker.completed_count(&ids), 1);
        assert!(!tracker.wait_for_all(&ids, Duration::from_millis(20)).await);

        tracker.complete_task("b");
        assert!(tracker.wait_for_all(&ids, Duration::from_millis(20)).await);
    }
}

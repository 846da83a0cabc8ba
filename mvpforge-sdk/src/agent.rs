//! Addressable agents with an unbounded, ordered mailbox.
//!
//! An agent owns one mailbox and one handler. Its receive loop hands
//! messages to the handler strictly one at a time; different agents run
//! their loops as separate tasks and interleave freely.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::message::{Message, Payload};

/// How long the receive loop waits on an empty mailbox before re-checking
/// the running flag.
pub const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Globally unique agent identifier (128 random bits, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message handler attached to an agent.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, message: Message<T>) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<T, F, Fut> Handler<T> for FnHandler<F>
where
    T: Payload,
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<T, F, Fut>(f: F) -> Arc<dyn Handler<T>>
where
    T: Payload,
    F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handler installed until the owner attaches a real one: logs and discards.
struct LogHandler {
    name: String,
}

#[async_trait]
impl<T: Payload> Handler<T> for LogHandler {
    async fn handle(&self, message: Message<T>) -> Result<()> {
        tracing::debug!(
            agent = %self.name,
            from = %message.sender_id.short(),
            kind = %message.message_type(),
            "Unhandled message"
        );
        Ok(())
    }
}

/// An actor with a mailbox.
pub struct Agent<T> {
    id: AgentId,
    name: String,
    tx: mpsc::UnboundedSender<Message<T>>,
    rx: Mutex<mpsc::UnboundedReceiver<Message<T>>>,
    handler: RwLock<Arc<dyn Handler<T>>>,
    running: AtomicBool,
    /// Queued plus in-flight messages.
    pending: AtomicUsize,
}

impl<T: Payload> Agent<T> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_id(AgentId::generate(), name)
    }

    pub fn with_id(id: AgentId, name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            handler: RwLock::new(Arc::new(LogHandler { name: name.clone() })),
            name,
            tx,
            rx: Mutex::new(rx),
            running: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_handler(&self, handler: Arc<dyn Handler<T>>) {
        *self.handler.write() = handler;
    }

    /// Put a message in this agent's mailbox. Never blocks.
    pub fn enqueue(&self, message: Message<T>) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Send `content` directly to `receiver`, bypassing any bus.
    pub fn send(&self, receiver: &Agent<T>, content: T) -> bool {
        let message = Message::new(self.id.clone(), receiver.id.clone(), content);
        tracing::debug!(from = %self.name, to = %receiver.name, kind = %message.message_type(), "Sent");
        receiver.enqueue(message)
    }

    /// Messages queued or currently being handled.
    pub fn queue_len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.queue_len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!(agent = %self.name, id = %self.id.short(), "Agent started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(agent = %self.name, "Agent stopped");
    }

    /// Process the mailbox until the agent is stopped and the mailbox is drained.
    ///
    /// Handler errors are returned to the caller; the failing message counts
    /// as consumed.
    pub async fn receive_loop(&self) -> Result<()> {
        let mut rx = self.rx.lock().await;
        while self.is_running() || self.queue_len() > 0 {
            let message = match tokio::time::timeout(RECEIVE_POLL, rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => continue,
            };
            let kind = message.message_type();
            let handler = self.handler.read().clone();
            let result = handler.handle(message).await;
            self.pending.fetch_sub(1, Ordering::SeqCst);
            result.with_context(|| format!("{} failed handling {kind}", self.name))?;
        }
        Ok(())
    }

    /// Mark running and drive the receive loop to completion.
    pub async fn run(&self) -> Result<()> {
        self.start();
        self.receive_loop().await
    }

    /// Mark running and drive the receive loop on a new task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        self.start();
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.receive_loop().await })
    }
}

impl<T> fmt::Debug for Agent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(agent: &Arc<Agent<String>>) -> Arc<parking_lot::Mutex<Vec<String>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        agent.set_handler(handler_fn(move |msg: Message<String>| {
            let sink = sink.clone();
            async move {
                sink.lock().push(msg.content);
                Ok::<_, anyhow::Error>(())
            }
        }));
        seen
    }

    #[test]
    fn test_ids_are_unique() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.short().len(), 8);
    }

    #[tokio::test]
    async fn test_direct_send_is_handled_once() {
        let alice = Agent::<String>::new("alice");
        let bob = Agent::<String>::new("bob");
        let seen = recorder(&bob);

        assert!(alice.send(&bob, "Hello".into()));
        assert_eq!(bob.queue_len(), 1);

        // Not running: the loop drains what is queued, then exits.
        bob.receive_loop().await.unwrap();
        assert_eq!(*seen.lock(), vec!["Hello".to_string()]);
        assert!(bob.is_idle());
    }

    #[tokio::test]
    async fn test_stopped_agent_drains_queue_in_order() {
        let sender = Agent::<String>::new("sender");
        let worker = Agent::<String>::new("worker");
        let seen = recorder(&worker);

        let handle = worker.spawn();
        for i in 0..3 {
            sender.send(&worker, format!("m{i}"));
        }
        worker.stop();
        handle.await.unwrap().unwrap();

        assert_eq!(*seen.lock(), vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_handler_runs_sequentially() {
        let sender = Agent::<String>::new("sender");
        let worker = Agent::<String>::new("worker");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let (a, m) = (active.clone(), max_seen.clone());
        worker.set_handler(handler_fn(move |_msg: Message<String>| {
            let (a, m) = (a.clone(), m.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        }));

        for i in 0..5 {
            sender.send(&worker, i.to_string());
        }
        worker.receive_loop().await.unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_to_loop_owner() {
        let sender = Agent::<String>::new("sender");
        let worker = Agent::<String>::new("worker");
        worker.set_handler(handler_fn(|_msg: Message<String>| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        }));

        sender.send(&worker, "x".into());
        let err = worker.receive_loop().await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        // The failing message still counts as consumed.
        assert!(worker.is_idle());
    }
}

//! Central message bus: agent directory plus routing.
//!
//! Every route ends in an enqueue on the target's mailbox, so sends never
//! wait on the receiver. Sends that reference an unknown agent or topic are
//! dropped with a warning, counted, and reported to the observer; they never
//! fail the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::agent::{Agent, AgentId};
use crate::event::{BusEvent, DropReason};
use crate::message::{Message, Payload};

pub struct MessageBus<T> {
    agents: RwLock<HashMap<AgentId, Arc<Agent<T>>>>,
    /// topic -> subscribers, in subscription order.
    topics: RwLock<HashMap<String, Vec<AgentId>>>,
    dropped: AtomicU64,
    observer: RwLock<Option<mpsc::UnboundedSender<BusEvent>>>,
}

impl<T: Payload> Default for MessageBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> MessageBus<T> {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            observer: RwLock::new(None),
        }
    }

    /// Start receiving bus events. Replaces any previous observer.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.observer.write() = Some(tx);
        rx
    }

    fn emit(&self, event: BusEvent) {
        if let Some(tx) = self.observer.read().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn drop_message(&self, from: &AgentId, to: Option<&AgentId>, kind: &str, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            from = %from.short(),
            to = %to.map(|id| id.short()).unwrap_or("-"),
            kind,
            %reason,
            "Message dropped"
        );
        self.emit(BusEvent::Dropped {
            from: from.clone(),
            to: to.cloned(),
            kind: kind.to_string(),
            reason,
        });
    }

    /// Number of sends dropped since the bus was created.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn register(&self, agent: &Arc<Agent<T>>) {
        self.agents
            .write()
            .insert(agent.id().clone(), Arc::clone(agent));
        tracing::debug!(agent = %agent.name(), id = %agent.id().short(), "Registered agent");
        self.emit(BusEvent::Registered {
            agent: agent.id().clone(),
            name: agent.name().to_string(),
        });
    }

    pub fn unregister(&self, agent_id: &AgentId) {
        if self.agents.write().remove(agent_id).is_some() {
            tracing::debug!(id = %agent_id.short(), "Unregistered agent");
            self.emit(BusEvent::Unregistered {
                agent: agent_id.clone(),
            });
        }
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<Arc<Agent<T>>> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn agents(&self) -> Vec<Arc<Agent<T>>> {
        self.agents.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    fn deliver(&self, receiver: &Agent<T>, message: Message<T>) -> bool {
        let from = message.sender_id.clone();
        let kind = message.message_type();
        let delivered = receiver.enqueue(message);
        if delivered {
            self.emit(BusEvent::Delivered {
                from,
                to: receiver.id().clone(),
                kind,
            });
        }
        delivered
    }

    /// Send from one registered agent to another. Returns false when dropped.
    pub fn send_to_agent(&self, sender_id: &AgentId, receiver_id: &AgentId, content: T) -> bool {
        let kind = content.kind();
        let (sender, receiver) = {
            let agents = self.agents.read();
            (agents.get(sender_id).cloned(), agents.get(receiver_id).cloned())
        };
        let Some(sender) = sender else {
            self.drop_message(sender_id, Some(receiver_id), kind, DropReason::UnknownSender);
            return false;
        };
        let Some(receiver) = receiver else {
            self.drop_message(sender_id, Some(receiver_id), kind, DropReason::UnknownReceiver);
            return false;
        };

        tracing::debug!(from = %sender.name(), to = %receiver.name(), kind, "Bus send");
        self.deliver(
            &receiver,
            Message::new(sender_id.clone(), receiver_id.clone(), content),
        )
    }

    /// Fan `content` out to every registered agent. Returns the number of
    /// mailboxes it landed in; all enqueues are done when this returns.
    pub fn broadcast(&self, sender_id: &AgentId, content: T, exclude_sender: bool) -> usize {
        let kind = content.kind();
        let targets: Vec<Arc<Agent<T>>> = {
            let agents = self.agents.read();
            if !agents.contains_key(sender_id) {
                drop(agents);
                self.drop_message(sender_id, None, kind, DropReason::UnknownSender);
                return 0;
            }
            agents
                .values()
                .filter(|agent| !(exclude_sender && agent.id() == sender_id))
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for agent in &targets {
            let message = Message::new(sender_id.clone(), agent.id().clone(), content.clone());
            if self.deliver(agent, message) {
                delivered += 1;
            }
        }
        tracing::debug!(from = %sender_id.short(), kind, delivered, "Broadcast");
        delivered
    }

    /// Subscribe a registered agent to `topic`. Re-subscribing is a no-op.
    pub fn subscribe(&self, agent_id: &AgentId, topic: &str) {
        if !self.agents.read().contains_key(agent_id) {
            tracing::warn!(id = %agent_id.short(), topic, "Subscribe from unknown agent ignored");
            return;
        }
        let mut topics = self.topics.write();
        let subscribers = topics.entry(topic.to_string()).or_default();
        if subscribers.contains(agent_id) {
            return;
        }
        subscribers.push(agent_id.clone());
        drop(topics);
        tracing::debug!(id = %agent_id.short(), topic, "Subscribed");
        self.emit(BusEvent::Subscribed {
            agent: agent_id.clone(),
            topic: topic.to_string(),
        });
    }

    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    /// Deliver to every current subscriber of `topic` except the sender,
    /// in subscription order. Returns the number delivered.
    pub fn publish_to_topic(&self, sender_id: &AgentId, topic: &str, content: T) -> usize {
        let kind = content.kind();
        let Some(subscribers) = self.topics.read().get(topic).cloned() else {
            self.drop_message(sender_id, None, kind, DropReason::UnknownTopic);
            return 0;
        };
        if !self.agents.read().contains_key(sender_id) {
            self.drop_message(sender_id, None, kind, DropReason::UnknownSender);
            return 0;
        }

        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|id| *id != sender_id) {
            let Some(agent) = self.agent(subscriber) else {
                continue;
            };
            let message = Message::new(sender_id.clone(), subscriber.clone(), content.clone())
                .on_topic(topic);
            if self.deliver(&agent, message) {
                delivered += 1;
            }
        }
        tracing::debug!(topic, delivered, "Published");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::handler_fn;

    fn bus_with(names: &[&str]) -> (MessageBus<String>, Vec<Arc<Agent<String>>>) {
        let bus = MessageBus::new();
        let agents: Vec<_> = names.iter().map(|n| Agent::new(*n)).collect();
        for agent in &agents {
            bus.register(agent);
        }
        (bus, agents)
    }

    #[tokio::test]
    async fn test_alice_says_hello_to_bob() {
        let (bus, agents) = bus_with(&["alice", "bob"]);
        let (alice, bob) = (&agents[0], &agents[1]);

        let received = Arc::new(parking_lot::Mutex::new(Vec::<Message<String>>::new()));
        let sink = received.clone();
        bob.set_handler(handler_fn(move |msg: Message<String>| {
            let sink = sink.clone();
            async move {
                sink.lock().push(msg);
                Ok::<_, anyhow::Error>(())
            }
        }));

        assert!(bus.send_to_agent(alice.id(), bob.id(), "Hello".to_string()));
        bob.receive_loop().await.unwrap();

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content, "Hello");
        assert_eq!(&received[0].sender_id, alice.id());
    }

    #[test]
    fn test_unknown_agents_are_dropped_silently() {
        let (bus, agents) = bus_with(&["alice"]);
        let mut events = bus.observe();
        let ghost = AgentId::generate();

        assert!(!bus.send_to_agent(agents[0].id(), &ghost, "x".into()));
        assert!(!bus.send_to_agent(&ghost, agents[0].id(), "x".into()));
        assert_eq!(bus.dropped_count(), 2);
        assert!(agents[0].is_idle());

        match events.try_recv().unwrap() {
            BusEvent::Dropped { reason, .. } => assert_eq!(reason, DropReason::UnknownReceiver),
            other => panic!("Expected Dropped, got {:?}", other),
        }
        match events.try_recv().unwrap() {
            BusEvent::Dropped { reason, .. } => assert_eq!(reason, DropReason::UnknownSender),
            other => panic!("Expected Dropped, got {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_respects_exclude_sender() {
        let (bus, agents) = bus_with(&["a", "b", "c"]);

        assert_eq!(bus.broadcast(agents[0].id(), "hi".into(), true), 2);
        assert!(agents[0].is_idle());
        assert_eq!(agents[1].queue_len(), 1);
        assert_eq!(agents[2].queue_len(), 1);

        assert_eq!(bus.broadcast(agents[0].id(), "hi".into(), false), 3);
        assert_eq!(agents[0].queue_len(), 1);
        assert_eq!(agents[1].queue_len(), 2);
    }

    #[test]
    fn test_topics_skip_sender_and_suppress_duplicates() {
        let (bus, agents) = bus_with(&["pub", "s1", "s2"]);
        bus.subscribe(agents[1].id(), "news");
        bus.subscribe(agents[1].id(), "news");
        bus.subscribe(agents[2].id(), "news");
        bus.subscribe(agents[0].id(), "news");

        assert_eq!(
            bus.subscribers("news"),
            vec![
                agents[1].id().clone(),
                agents[2].id().clone(),
                agents[0].id().clone()
            ]
        );

        assert_eq!(bus.publish_to_topic(agents[0].id(), "news", "x".into()), 2);
        assert!(agents[0].is_idle());
        assert_eq!(agents[1].queue_len(), 1);

        // Unknown topic is a no-op.
        assert_eq!(bus.publish_to_topic(agents[0].id(), "sports", "x".into()), 0);
        assert_eq!(agents[2].queue_len(), 1);
    }

    #[test]
    fn test_register_is_idempotent() {
        let (bus, agents) = bus_with(&["a"]);
        bus.register(&agents[0]);
        assert_eq!(bus.len(), 1);
        bus.unregister(agents[0].id());
        bus.unregister(agents[0].id());
        assert!(bus.is_empty());
    }
}

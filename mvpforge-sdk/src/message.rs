//! Messages exchanged between agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// Anything that can travel through a mailbox.
///
/// `kind()` is the short tag shown in logs and bus events. Handlers
/// dispatch on the payload's own type, never on this string.
pub trait Payload: Clone + Send + Sync + 'static {
    fn kind(&self) -> &'static str;
}

impl Payload for String {
    fn kind(&self) -> &'static str {
        "text"
    }
}

impl Payload for serde_json::Value {
    fn kind(&self) -> &'static str {
        "json"
    }
}

/// An immutable envelope: created by the sender, consumed once by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    pub sender_id: AgentId,
    pub receiver_id: AgentId,
    /// Set when the message was delivered through a topic.
    pub topic: Option<String>,
    pub content: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: Payload> Message<T> {
    pub fn new(sender_id: AgentId, receiver_id: AgentId, content: T) -> Self {
        Self {
            sender_id,
            receiver_id,
            topic: None,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn on_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    /// Tag used in logs: `topic:<name>` for topic deliveries, else the payload kind.
    pub fn message_type(&self) -> String {
        match &self.topic {
            Some(topic) => format!("topic:{topic}"),
            None => self.content.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_prefers_topic() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        let msg = Message::new(a.clone(), b.clone(), "hi".to_string());
        assert_eq!(msg.message_type(), "text");
        assert!(msg.topic.is_none());

        let msg = Message::new(a, b, "hi".to_string()).on_topic("builds");
        assert_eq!(msg.message_type(), "topic:builds");
    }
}

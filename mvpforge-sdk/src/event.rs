//! Events emitted by the message bus for observers to consume.

use crate::agent::AgentId;

/// Why a send was dropped instead of delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnknownSender,
    UnknownReceiver,
    /// Topic has no subscriber list at all.
    UnknownTopic,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::UnknownSender => write!(f, "unknown sender"),
            DropReason::UnknownReceiver => write!(f, "unknown receiver"),
            DropReason::UnknownTopic => write!(f, "unknown topic"),
        }
    }
}

/// Bus activity, as seen by an observer (tests, progress reporting, metrics).
#[derive(Debug, Clone)]
pub enum BusEvent {
    Registered {
        agent: AgentId,
        name: String,
    },

    Unregistered {
        agent: AgentId,
    },

    /// One message enqueued on one mailbox.
    Delivered {
        from: AgentId,
        to: AgentId,
        kind: String,
    },

    /// A send that went nowhere.
    Dropped {
        from: AgentId,
        to: Option<AgentId>,
        kind: String,
        reason: DropReason,
    },

    Subscribed {
        agent: AgentId,
        topic: String,
    },
}

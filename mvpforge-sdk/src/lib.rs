//! mvpforge-sdk: the messaging substrate shared by every mvpforge agent.
//!
//! - [`agent`]: addressable actors with an unbounded FIFO mailbox
//! - [`bus`]: agent directory with direct send, broadcast and topics
//! - [`tracker`]: named completion events for cooperative waiting
//! - [`wait`]: completion detection across many agents

pub mod agent;
pub mod bus;
pub mod event;
pub mod message;
pub mod tracker;
pub mod wait;

pub use agent::{Agent, AgentId, Handler, handler_fn};
pub use bus::MessageBus;
pub use message::{Message, Payload};
pub use tracker::TaskTracker;
pub use wait::wait_for_completion;

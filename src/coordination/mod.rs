//! Agent message bus: typed messages, delivery modes, retry and dead-lettering.
//!
//! The bus owns delivery state only. Queues live behind [`QueueStore`];
//! roles and project membership come from an [`AgentDirectory`].

pub mod bus;
pub mod directory;
pub mod error;
pub mod handler;
pub mod message;
pub mod protocol;
pub mod store;
mod workers;

pub use bus::{
    BusStatistics, DeadLetterEntry, DeliveryMode, DeliveryStats, DispatchSweep, MessageBus,
    MessageStatusReport, QueuedEnvelope, RetrySweep, SendReceipt, TrackedMessage,
    RETRY_EXHAUSTED_REASON,
};
pub use directory::{AgentDirectory, StaticAgentDirectory};
pub use error::BusError;
pub use handler::{HandlerFuture, HandlerTable, MessageHandler};
pub use message::{
    AgentMessage, MessageCategory, MessagePriority, MessageStatus, MessageType, Payload,
    DEFAULT_MAX_DELIVERY_ATTEMPTS,
};
pub use protocol::{MessageProtocol, MessageTemplate, PROTOCOL_VERSION};
pub use store::{InMemoryQueueStore, QueueStore};

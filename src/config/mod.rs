pub mod schema;

pub use schema::{AgentEntryConfig, BusConfig, Config, ProtocolConfig, WorkerConfig};

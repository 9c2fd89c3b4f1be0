use super::bus::DeliveryMode;
use thiserror::Error;

/// Errors surfaced by the message bus to its callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("message `{message_id}` failed validation: {}", violations.join("; "))]
    Validation {
        message_id: String,
        violations: Vec<String>,
    },
    #[error("agent id must not be empty")]
    EmptyAgentId,
    #[error("message id `{message_id}` is already tracked")]
    DuplicateMessageId { message_id: String },
    #[error("unknown target agent `{agent}` for message `{message_id}`")]
    UnknownAgent { agent: String, message_id: String },
    #[error("project-based message `{message_id}` is missing `project_id`")]
    MissingProjectId { message_id: String },
    #[error("no recipients resolved for {mode} message `{message_id}`")]
    NoRecipients {
        message_id: String,
        mode: DeliveryMode,
    },
    #[error("delivery of message `{message_id}` failed: {reason}")]
    Delivery { message_id: String, reason: String },
    #[error("agent directory error: {0}")]
    Directory(String),
    #[error("queue store error: {0}")]
    Store(String),
    #[error("envelope codec error: {0}")]
    Codec(String),
}

impl BusError {
    /// Routing errors never reach the store and leave nothing tracked.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::UnknownAgent { .. } | Self::MissingProjectId { .. } | Self::NoRecipients { .. }
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

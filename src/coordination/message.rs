use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default cap on delivery attempts for a single message.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Open key-value payload carried by every message.
pub type Payload = Map<String, Value>;

/// Closed set of message types exchanged by the agent team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Work coordination
    TaskAssignment,
    WorkComplete,
    WorkRequest,
    DependencyReady,

    // Information sharing
    InformationShare,
    StatusUpdate,
    ProgressReport,

    // Problem resolution
    HelpRequest,
    ConflictReport,
    BlockerReport,

    // Quality assurance
    ValidationRequest,
    ValidationResponse,
    ReviewRequest,
    ReviewResponse,

    // Meeting coordination
    MeetingInvite,
    MeetingResponse,
    MeetingUpdate,

    // System
    Heartbeat,
    ErrorReport,
    ShutdownNotice,
}

/// Grouping of message types by purpose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    WorkCoordination,
    InformationSharing,
    ProblemResolution,
    QualityAssurance,
    MeetingCoordination,
    System,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        Self::TaskAssignment,
        Self::WorkComplete,
        Self::WorkRequest,
        Self::DependencyReady,
        Self::InformationShare,
        Self::StatusUpdate,
        Self::ProgressReport,
        Self::HelpRequest,
        Self::ConflictReport,
        Self::BlockerReport,
        Self::ValidationRequest,
        Self::ValidationResponse,
        Self::ReviewRequest,
        Self::ReviewResponse,
        Self::MeetingInvite,
        Self::MeetingResponse,
        Self::MeetingUpdate,
        Self::Heartbeat,
        Self::ErrorReport,
        Self::ShutdownNotice,
    ];

    /// Wire value of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskAssignment => "task_assignment",
            Self::WorkComplete => "work_complete",
            Self::WorkRequest => "work_request",
            Self::DependencyReady => "dependency_ready",
            Self::InformationShare => "information_share",
            Self::StatusUpdate => "status_update",
            Self::ProgressReport => "progress_report",
            Self::HelpRequest => "help_request",
            Self::ConflictReport => "conflict_report",
            Self::BlockerReport => "blocker_report",
            Self::ValidationRequest => "validation_request",
            Self::ValidationResponse => "validation_response",
            Self::ReviewRequest => "review_request",
            Self::ReviewResponse => "review_response",
            Self::MeetingInvite => "meeting_invite",
            Self::MeetingResponse => "meeting_response",
            Self::MeetingUpdate => "meeting_update",
            Self::Heartbeat => "heartbeat",
            Self::ErrorReport => "error_report",
            Self::ShutdownNotice => "shutdown_notice",
        }
    }

    pub fn category(self) -> MessageCategory {
        match self {
            Self::TaskAssignment | Self::WorkComplete | Self::WorkRequest | Self::DependencyReady => {
                MessageCategory::WorkCoordination
            }
            Self::InformationShare | Self::StatusUpdate | Self::ProgressReport => {
                MessageCategory::InformationSharing
            }
            Self::HelpRequest | Self::ConflictReport | Self::BlockerReport => {
                MessageCategory::ProblemResolution
            }
            Self::ValidationRequest
            | Self::ValidationResponse
            | Self::ReviewRequest
            | Self::ReviewResponse => MessageCategory::QualityAssurance,
            Self::MeetingInvite | Self::MeetingResponse | Self::MeetingUpdate => {
                MessageCategory::MeetingCoordination
            }
            Self::Heartbeat | Self::ErrorReport | Self::ShutdownNotice => MessageCategory::System,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown message type: {value}"))
    }
}

/// Message priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// Immediate attention required
    Critical,
    /// Handle within minutes
    High,
    /// Handle within the hour
    #[default]
    Medium,
    /// Handle when convenient
    Low,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagePriority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown message priority: {other}")),
        }
    }
}

/// Delivery lifecycle status of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Delivered,
    Read,
    Processed,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Failed -> Pending` is the retry edge; its bound is enforced by the bus.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::{Delivered, Expired, Failed, Pending, Processed, Read};
        matches!(
            (self, next),
            (Pending, Delivered)
                | (Pending, Failed)
                | (Delivered, Read)
                | (Delivered, Processed)
                | (Delivered, Failed)
                | (Read, Processed)
                | (Read, Failed)
                | (Failed, Pending)
                | (_, Expired)
        ) && self != Expired
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

fn default_max_delivery_attempts() -> u32 {
    DEFAULT_MAX_DELIVERY_ATTEMPTS
}

/// Standard message exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,

    pub from_agent: String,
    /// Agent id, `*`, or a role name depending on delivery mode.
    pub to_agent: String,
    pub message_type: MessageType,

    #[serde(default)]
    pub priority: MessagePriority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub payload: Payload,

    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub sprint_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,

    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub delivery_attempts: u32,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub response_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

impl AgentMessage {
    /// Build a pending message with a fresh id and the current timestamp.
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message_type: MessageType,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: None,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message_type,
            priority: MessagePriority::default(),
            created_at: Utc::now(),
            expires_at: None,
            subject: String::new(),
            payload,
            project_id: None,
            sprint_id: None,
            task_id: None,
            status: MessageStatus::Pending,
            delivery_attempts: 0,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            requires_response: false,
            response_timeout_seconds: None,
            in_reply_to: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_response(mut self, timeout_seconds: Option<u64>) -> Self {
        self.requires_response = true;
        self.response_timeout_seconds = timeout_seconds;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// A failed message may be retried while attempts remain and it has not expired.
    pub fn should_retry_delivery(&self) -> bool {
        self.status == MessageStatus::Failed
            && self.delivery_attempts < self.max_delivery_attempts
            && !self.is_expired()
    }

    /// Conversation lineage shared by this message and every reply to it.
    pub fn lineage(&self) -> &str {
        self.conversation_id.as_deref().unwrap_or(&self.message_id)
    }

    /// Build a reply addressed back to this message's sender.
    pub fn create_reply(
        &self,
        from_agent: impl Into<String>,
        message_type: MessageType,
        payload: Payload,
    ) -> AgentMessage {
        let mut reply = AgentMessage::new(from_agent, self.from_agent.clone(), message_type, payload);
        reply.conversation_id = Some(self.lineage().to_string());
        reply.priority = self.priority;
        reply.subject = format!("Re: {}", self.subject);
        reply.project_id = self.project_id.clone();
        reply.sprint_id = self.sprint_id.clone();
        reply.task_id = self.task_id.clone();
        reply.in_reply_to = Some(self.message_id.clone());
        reply
    }

    /// Copy of this message for another recipient, with a new id and shared lineage.
    pub fn fan_out_copy(&self, to_agent: &str) -> AgentMessage {
        let mut copy = self.clone();
        copy.message_id = Uuid::new_v4().to_string();
        copy.conversation_id = Some(self.lineage().to_string());
        copy.to_agent = to_agent.to_string();
        copy
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn json_round_trip_preserves_fields_and_enum_strings() {
        let mut message = AgentMessage::new(
            "pm-1",
            "dev-1",
            MessageType::TaskAssignment,
            payload(json!({"task": {"title": "Login page"}})),
        )
        .with_priority(MessagePriority::High)
        .with_project("hotel")
        .with_expiry(Utc::now() + Duration::minutes(5))
        .with_response(Some(300));
        message.sprint_id = Some("sprint-3".into());

        let raw = message.to_json().expect("serialize");
        let value: Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["message_type"], "task_assignment");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["status"], "pending");

        let decoded = AgentMessage::from_json(&raw).expect("deserialize");
        assert_eq!(decoded, message);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let raw = r#"{
            "message_id": "m-1",
            "from_agent": "qa-1",
            "to_agent": "dev-1",
            "message_type": "review_request",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let decoded = AgentMessage::from_json(raw).expect("deserialize");
        assert_eq!(decoded.priority, MessagePriority::Medium);
        assert_eq!(decoded.status, MessageStatus::Pending);
        assert_eq!(decoded.max_delivery_attempts, DEFAULT_MAX_DELIVERY_ATTEMPTS);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn reply_inherits_correlation_and_targets_sender() {
        let root = AgentMessage::new("pm-1", "dev-1", MessageType::WorkRequest, Payload::new())
            .with_subject("Build API")
            .with_project("hotel")
            .with_task("task-7")
            .with_priority(MessagePriority::Critical);

        let reply = root.create_reply("dev-1", MessageType::StatusUpdate, Payload::new());
        assert_eq!(reply.to_agent, "pm-1");
        assert_eq!(reply.from_agent, "dev-1");
        assert_eq!(reply.conversation_id.as_deref(), Some(root.message_id.as_str()));
        assert_eq!(reply.in_reply_to.as_deref(), Some(root.message_id.as_str()));
        assert_eq!(reply.priority, MessagePriority::Critical);
        assert_eq!(reply.project_id.as_deref(), Some("hotel"));
        assert_eq!(reply.task_id.as_deref(), Some("task-7"));
        assert_eq!(reply.subject, "Re: Build API");
        assert_ne!(reply.message_id, root.message_id);

        let second = reply.create_reply("pm-1", MessageType::WorkComplete, Payload::new());
        assert_eq!(second.conversation_id, reply.conversation_id);
    }

    #[test]
    fn retry_predicate_respects_cap_and_expiry() {
        let mut message =
            AgentMessage::new("a", "b", MessageType::Heartbeat, Payload::new());
        assert!(!message.should_retry_delivery());

        message.status = MessageStatus::Failed;
        assert!(message.should_retry_delivery());

        message.delivery_attempts = message.max_delivery_attempts;
        assert!(!message.should_retry_delivery());

        message.delivery_attempts = 0;
        message.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(message.is_expired());
        assert!(!message.should_retry_delivery());
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Processed));
        assert!(Delivered.can_transition_to(Read));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Processed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Processed));
        assert!(!Expired.can_transition_to(Pending));
    }

    #[test]
    fn message_type_parses_wire_values_and_reports_category() {
        for kind in MessageType::ALL {
            assert_eq!(kind.as_str().parse::<MessageType>(), Ok(kind));
        }
        assert_eq!(
            MessageType::ConflictReport.category(),
            MessageCategory::ProblemResolution
        );
        assert_eq!(MessageType::Heartbeat.category(), MessageCategory::System);
        assert!("carrier_pigeon".parse::<MessageType>().is_err());
    }
}

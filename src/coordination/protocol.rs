//! Message factories and validation rules for agent traffic.

use super::message::{AgentMessage, MessagePriority, MessageType, Payload};
use crate::config::ProtocolConfig;
use chrono::Utc;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "1.0";

const HELP_REQUEST_TIMEOUT_SECS: u64 = 1800;
const VALIDATION_TIMEOUT_SECS: u64 = 3600;
const MEETING_RESPONSE_TIMEOUT_SECS: u64 = 7200;

/// Static description of the payload shape expected for a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTemplate {
    pub required_fields: &'static [&'static str],
    pub optional_fields: &'static [&'static str],
    pub response_required: bool,
}

/// Builds well-formed messages and reports every rule a message violates.
#[derive(Debug, Clone)]
pub struct MessageProtocol {
    config: ProtocolConfig,
}

impl Default for MessageProtocol {
    fn default() -> Self {
        Self::new(ProtocolConfig::default())
    }
}

impl MessageProtocol {
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn max_message_size_bytes(&self) -> usize {
        self.config.max_message_size_bytes
    }

    pub fn template(&self, message_type: MessageType) -> Option<MessageTemplate> {
        match message_type {
            MessageType::TaskAssignment => Some(MessageTemplate {
                required_fields: &["task"],
                optional_fields: &["deadline", "requirements", "dependencies"],
                response_required: true,
            }),
            MessageType::WorkComplete => Some(MessageTemplate {
                required_fields: &["result"],
                optional_fields: &["completion_time", "quality_metrics", "next_steps"],
                response_required: true,
            }),
            MessageType::HelpRequest => Some(MessageTemplate {
                required_fields: &["problem_description"],
                optional_fields: &["context", "attempted_solutions", "urgency_reason"],
                response_required: true,
            }),
            MessageType::StatusUpdate => Some(MessageTemplate {
                required_fields: &["current_status"],
                optional_fields: &["current_task", "progress", "blockers", "estimated_completion"],
                response_required: false,
            }),
            _ => None,
        }
    }

    /// Validate a message and return every violated rule; empty means valid.
    pub fn validate(&self, message: &AgentMessage) -> Vec<String> {
        let mut errors = Vec::new();

        if message.message_id.trim().is_empty() {
            errors.push("Missing message_id".to_string());
        }
        if message.from_agent.trim().is_empty() {
            errors.push("Missing from_agent".to_string());
        }
        if message.to_agent.trim().is_empty() {
            errors.push("Missing to_agent".to_string());
        }

        match message.to_json() {
            Ok(raw) => {
                let size = raw.len();
                if size > self.config.max_message_size_bytes {
                    errors.push(format!(
                        "Message too large: {size} bytes (max: {})",
                        self.config.max_message_size_bytes
                    ));
                }
            }
            Err(error) => errors.push(format!("Message is not serializable: {error}")),
        }

        if let Some(expires_at) = message.expires_at {
            if expires_at < message.created_at {
                errors.push("expires_at precedes created_at".to_string());
            }
        }
        if message.is_expired() {
            errors.push("Message has expired".to_string());
        }

        errors.extend(validate_payload_shape(message));
        errors
    }

    pub fn create_task_assignment(
        &self,
        from_agent: &str,
        to_agent: &str,
        task_details: &Value,
        project_id: &str,
        priority: MessagePriority,
    ) -> AgentMessage {
        let payload = object(json!({
            "task": task_details,
            "deadline": task_details.get("deadline").cloned().unwrap_or(Value::Null),
            "requirements": field_or_empty_array(task_details, "requirements"),
            "dependencies": field_or_empty_array(task_details, "dependencies"),
        }));

        self.stamp(AgentMessage::new(
            from_agent,
            to_agent,
            MessageType::TaskAssignment,
            payload,
        ))
        .with_priority(priority)
        .with_subject(format!(
            "Task Assignment: {}",
            str_field(task_details, "title", "New Task")
        ))
        .with_project(project_id)
        .with_response(Some(self.config.default_response_timeout_secs))
    }

    pub fn create_work_complete(
        &self,
        from_agent: &str,
        to_agent: &str,
        work_result: &Value,
        project_id: &str,
        task_id: Option<&str>,
    ) -> AgentMessage {
        let payload = object(json!({
            "result": work_result,
            "completion_time": Utc::now().to_rfc3339(),
            "quality_metrics": work_result.get("quality_metrics").cloned().unwrap_or_else(|| json!({})),
            "next_steps": field_or_empty_array(work_result, "next_steps"),
        }));

        let mut message = self
            .stamp(AgentMessage::new(
                from_agent,
                to_agent,
                MessageType::WorkComplete,
                payload,
            ))
            .with_priority(MessagePriority::High)
            .with_subject(format!(
                "Work Complete: {}",
                str_field(work_result, "task_name", "Task")
            ))
            .with_project(project_id)
            .with_response(None);
        message.task_id = task_id.map(str::to_string);
        message
    }

    pub fn create_help_request(
        &self,
        from_agent: &str,
        to_agent: &str,
        help_details: &Value,
        project_id: &str,
        urgency: MessagePriority,
    ) -> AgentMessage {
        let payload = object(json!({
            "problem_description": str_field(help_details, "problem", ""),
            "context": help_details.get("context").cloned().unwrap_or_else(|| json!({})),
            "attempted_solutions": field_or_empty_array(help_details, "attempted"),
            "urgency_reason": str_field(help_details, "urgency_reason", ""),
        }));

        self.stamp(AgentMessage::new(
            from_agent,
            to_agent,
            MessageType::HelpRequest,
            payload,
        ))
        .with_priority(urgency)
        .with_subject(format!(
            "Help Needed: {}",
            str_field(help_details, "topic", "Assistance Required")
        ))
        .with_project(project_id)
        .with_response(Some(HELP_REQUEST_TIMEOUT_SECS))
    }

    /// Conflicts always go to the configured escalation agent.
    pub fn create_conflict_report(
        &self,
        from_agent: &str,
        conflicting_agent: &str,
        conflict_details: &Value,
        project_id: &str,
    ) -> AgentMessage {
        let payload = object(json!({
            "conflicting_agent": conflicting_agent,
            "conflict_type": str_field(conflict_details, "type", "unknown"),
            "description": str_field(conflict_details, "description", ""),
            "our_position": str_field(conflict_details, "our_position", ""),
            "their_position": str_field(conflict_details, "their_position", ""),
            "impact": str_field(conflict_details, "impact", "medium"),
            "suggested_resolution": str_field(conflict_details, "suggestion", ""),
        }));

        self.stamp(AgentMessage::new(
            from_agent,
            self.config.escalation_agent.clone(),
            MessageType::ConflictReport,
            payload,
        ))
        .with_priority(MessagePriority::High)
        .with_subject(format!(
            "Conflict Report: {from_agent} vs {conflicting_agent}"
        ))
        .with_project(project_id)
        .with_response(None)
    }

    pub fn create_validation_request(
        &self,
        from_agent: &str,
        to_agent: &str,
        validation_data: &Value,
        project_id: &str,
    ) -> AgentMessage {
        let payload = object(json!({
            "validation_type": str_field(validation_data, "type", "general"),
            "item_to_validate": validation_data.get("item").cloned().unwrap_or_else(|| json!({})),
            "validation_criteria": field_or_empty_array(validation_data, "criteria"),
            "context": validation_data.get("context").cloned().unwrap_or_else(|| json!({})),
            "deadline": validation_data.get("deadline").cloned().unwrap_or(Value::Null),
        }));

        self.stamp(AgentMessage::new(
            from_agent,
            to_agent,
            MessageType::ValidationRequest,
            payload,
        ))
        .with_subject(format!(
            "Validation Request: {}",
            str_field(validation_data, "item_type", "Item")
        ))
        .with_project(project_id)
        .with_response(Some(VALIDATION_TIMEOUT_SECS))
    }

    pub fn create_status_update(
        &self,
        from_agent: &str,
        to_agent: &str,
        status_data: &Value,
        project_id: &str,
    ) -> AgentMessage {
        let payload = object(json!({
            "current_status": str_field(status_data, "status", "working"),
            "current_task": status_data.get("current_task").cloned().unwrap_or_else(|| json!({})),
            "progress": status_data.get("progress").cloned().unwrap_or_else(|| json!(0.0)),
            "blockers": field_or_empty_array(status_data, "blockers"),
            "estimated_completion": status_data.get("eta").cloned().unwrap_or(Value::Null),
            "next_steps": field_or_empty_array(status_data, "next_steps"),
        }));

        self.stamp(AgentMessage::new(
            from_agent,
            to_agent,
            MessageType::StatusUpdate,
            payload,
        ))
        .with_priority(MessagePriority::Low)
        .with_subject(format!("Status Update from {from_agent}"))
        .with_project(project_id)
    }

    /// One invitation per attendee; every invitation lists all attendees.
    pub fn create_meeting_invites(
        &self,
        from_agent: &str,
        to_agents: &[String],
        meeting_details: &Value,
        project_id: &str,
    ) -> Vec<AgentMessage> {
        let title = str_field(meeting_details, "title", "");
        let subject_title = if title.is_empty() {
            "Team Meeting".to_string()
        } else {
            title.clone()
        };

        to_agents
            .iter()
            .map(|to_agent| {
                let payload = object(json!({
                    "meeting_type": str_field(meeting_details, "type", "general"),
                    "title": title,
                    "agenda": field_or_empty_array(meeting_details, "agenda"),
                    "scheduled_time": str_field(meeting_details, "time", ""),
                    "duration_minutes": meeting_details.get("duration").cloned().unwrap_or_else(|| json!(60)),
                    "attendees": to_agents,
                    "meeting_link": str_field(meeting_details, "link", ""),
                    "preparation_required": field_or_empty_array(meeting_details, "preparation"),
                }));

                self.stamp(AgentMessage::new(
                    from_agent,
                    to_agent.clone(),
                    MessageType::MeetingInvite,
                    payload,
                ))
                .with_subject(format!("Meeting Invitation: {subject_title}"))
                .with_project(project_id)
                .with_response(Some(MEETING_RESPONSE_TIMEOUT_SECS))
            })
            .collect()
    }

    fn stamp(&self, mut message: AgentMessage) -> AgentMessage {
        message.max_delivery_attempts = self.config.max_delivery_attempts;
        message
    }
}

fn validate_payload_shape(message: &AgentMessage) -> Vec<String> {
    let payload = &message.payload;
    let missing = |key: &str| !payload.contains_key(key);
    let mut errors = Vec::new();

    match message.message_type {
        MessageType::TaskAssignment => {
            if missing("task") {
                errors.push("Task assignment missing task details".to_string());
            }
        }
        MessageType::WorkComplete => {
            if missing("result") {
                errors.push("Work complete missing result".to_string());
            }
        }
        MessageType::HelpRequest => {
            if missing("problem_description") {
                errors.push("Help request missing problem description".to_string());
            }
        }
        MessageType::ConflictReport => {
            if missing("conflicting_agent") {
                errors.push("Conflict report missing conflicting agent".to_string());
            }
            if missing("description") {
                errors.push("Conflict report missing description".to_string());
            }
        }
        MessageType::ValidationRequest => {
            if missing("item_to_validate") {
                errors.push("Validation request missing item to validate".to_string());
            }
        }
        _ => {}
    }

    errors
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn str_field(source: &Value, key: &str, fallback: &str) -> String {
    source
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

fn field_or_empty_array(source: &Value, key: &str) -> Value {
    source.get(key).cloned().unwrap_or_else(|| json!([]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn task_assignment_factory_produces_valid_message() {
        let protocol = MessageProtocol::default();
        let message = protocol.create_task_assignment(
            "pm-1",
            "dev-1",
            &json!({"title": "Checkout flow", "requirements": ["tests"]}),
            "hotel",
            MessagePriority::High,
        );

        assert_eq!(message.subject, "Task Assignment: Checkout flow");
        assert!(message.requires_response);
        assert_eq!(message.response_timeout_seconds, Some(300));
        assert_eq!(message.project_id.as_deref(), Some("hotel"));
        assert_eq!(message.payload["requirements"], json!(["tests"]));
        assert_eq!(message.payload["dependencies"], json!([]));
        assert!(protocol.validate(&message).is_empty());
    }

    #[test]
    fn validation_reports_every_violation() {
        let protocol = MessageProtocol::default();
        let mut message = AgentMessage::new("", "", MessageType::ConflictReport, Payload::new());
        message.expires_at = Some(message.created_at - Duration::seconds(10));

        let errors = protocol.validate(&message);
        assert!(errors.contains(&"Missing from_agent".to_string()));
        assert!(errors.contains(&"Missing to_agent".to_string()));
        assert!(errors.contains(&"expires_at precedes created_at".to_string()));
        assert!(errors.contains(&"Message has expired".to_string()));
        assert!(errors.contains(&"Conflict report missing conflicting agent".to_string()));
        assert!(errors.contains(&"Conflict report missing description".to_string()));
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn oversized_payload_is_reported_as_too_large() {
        let protocol = MessageProtocol::new(ProtocolConfig {
            max_message_size_bytes: 512,
            ..ProtocolConfig::default()
        });
        let mut payload = Payload::new();
        payload.insert("blob".into(), json!("x".repeat(1024)));
        let message = AgentMessage::new("a", "b", MessageType::InformationShare, payload);

        let errors = protocol.validate(&message);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Message too large"));
    }

    #[test]
    fn conflict_report_goes_to_escalation_agent() {
        let protocol = MessageProtocol::new(ProtocolConfig {
            escalation_agent: "lead-7".into(),
            ..ProtocolConfig::default()
        });
        let message = protocol.create_conflict_report(
            "dev-1",
            "arch-1",
            &json!({"type": "design", "description": "REST vs gRPC"}),
            "hotel",
        );
        assert_eq!(message.to_agent, "lead-7");
        assert_eq!(message.subject, "Conflict Report: dev-1 vs arch-1");
        assert!(protocol.validate(&message).is_empty());
    }

    #[test]
    fn meeting_invites_fan_out_with_full_attendee_list() {
        let protocol = MessageProtocol::default();
        let attendees = vec!["dev-1".to_string(), "qa-1".to_string()];
        let invites = protocol.create_meeting_invites(
            "pm-1",
            &attendees,
            &json!({"title": "Sprint planning", "duration": 30}),
            "hotel",
        );

        assert_eq!(invites.len(), 2);
        assert_eq!(invites[0].to_agent, "dev-1");
        assert_eq!(invites[1].to_agent, "qa-1");
        assert_ne!(invites[0].message_id, invites[1].message_id);
        assert_eq!(invites[0].payload["attendees"], json!(["dev-1", "qa-1"]));
        assert_eq!(invites[1].subject, "Meeting Invitation: Sprint planning");
        assert_eq!(invites[0].response_timeout_seconds, Some(7200));
    }

    #[test]
    fn factories_apply_configured_attempt_cap() {
        let protocol = MessageProtocol::new(ProtocolConfig {
            max_delivery_attempts: 5,
            ..ProtocolConfig::default()
        });
        let message =
            protocol.create_status_update("dev-1", "pm-1", &json!({"status": "blocked"}), "hotel");
        assert_eq!(message.max_delivery_attempts, 5);
        assert_eq!(message.payload["current_status"], "blocked");
        assert_eq!(message.priority, MessagePriority::Low);
    }

    #[test]
    fn templates_cover_core_work_types() {
        let protocol = MessageProtocol::default();
        let template = protocol
            .template(MessageType::TaskAssignment)
            .expect("task assignment template");
        assert_eq!(template.required_fields, &["task"]);
        assert!(template.response_required);
        assert!(protocol.template(MessageType::Heartbeat).is_none());
    }
}

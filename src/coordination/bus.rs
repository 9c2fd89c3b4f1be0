use super::directory::AgentDirectory;
use super::error::BusError;
use super::handler::MessageHandler;
use super::message::{AgentMessage, MessagePriority, MessageStatus, MessageType, Payload};
use super::protocol::{MessageProtocol, PROTOCOL_VERSION};
use super::store::QueueStore;
use super::workers;
use crate::config::schema::MAX_MESSAGE_TTL_SECS;
use crate::config::{BusConfig, Config, WorkerConfig};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reason recorded on dead-letter entries for exhausted retries.
pub const RETRY_EXHAUSTED_REASON: &str = "max_retry_attempts_exceeded";

/// Recipient selection strategy for `send_message`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// `to_agent` names one registered agent.
    #[default]
    Direct,
    /// Every registered agent except the sender.
    Broadcast,
    /// `to_agent` is a role name resolved through the agent directory.
    RoleBased,
    /// Every member of `project_id` except the sender.
    ProjectBased,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Broadcast => "broadcast",
            Self::RoleBased => "role_based",
            Self::ProjectBased => "project_based",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope pushed onto an agent queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedEnvelope {
    /// Serialized `AgentMessage` JSON.
    pub message: String,
    pub priority: MessagePriority,
    pub expires_at: DateTime<Utc>,
    /// Protocol version of the producer. Envelopes from older producers omit it.
    #[serde(default = "default_envelope_version")]
    pub protocol_version: String,
}

fn default_envelope_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Entry appended to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    /// Serialized `AgentMessage` JSON.
    pub message: String,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn decode_message(&self) -> Result<AgentMessage, BusError> {
        Ok(AgentMessage::from_json(&self.message)?)
    }
}

/// In-flight delivery record kept by the bus.
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    pub message: AgentMessage,
    pub sent_at: DateTime<Utc>,
    pub delivery_attempts: u32,
    pub status: MessageStatus,
    /// Set while a dead-letter push for this entry is in flight.
    pub dead_letter_pending: bool,
}

impl TrackedMessage {
    fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.message.status = status;
    }
}

/// Snapshot returned by `get_message_status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageStatusReport {
    pub message_id: String,
    pub status: MessageStatus,
    pub sent_at: DateTime<Utc>,
    pub delivery_attempts: u32,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: MessageType,
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct DeliveryStats {
    /// Envelopes enqueued (fan-out copies count individually).
    pub sent: u64,
    /// Tracked messages handed out by `receive_messages`.
    pub delivered: u64,
    /// Messages whose handler completed without error.
    pub processed: u64,
    /// Messages moved to the dead-letter queue.
    pub failed: u64,
    /// Messages dropped at receive time or reaped after expiry.
    pub expired: u64,
    /// Running mean of send-to-receive latency.
    pub average_delivery_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BusStatistics {
    pub registered_agents: usize,
    pub active_queues: usize,
    pub tracked_messages: usize,
    pub delivery_stats: DeliveryStats,
    pub queue_sizes: BTreeMap<String, usize>,
}

/// Result of a successful `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub mode: DeliveryMode,
    /// Ids of every enqueued message; fan-out copies carry fresh ids.
    pub message_ids: Vec<String>,
}

impl SendReceipt {
    pub fn delivered_to(&self) -> usize {
        self.message_ids.len()
    }
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrySweep {
    pub requeued: usize,
    pub redelivery_failed: usize,
    pub dead_lettered: usize,
    /// Exhausted entries whose dead-letter push failed; they stay tracked as
    /// `failed` and are dead-lettered on a later sweep.
    pub dead_letter_failed: usize,
    pub expired: usize,
}

/// Outcome of one dispatch sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSweep {
    pub agents: usize,
    pub failed_agents: usize,
    pub processed: usize,
}

struct AgentBinding {
    handler: Arc<dyn MessageHandler>,
    queue: String,
}

#[derive(Default)]
struct BusState {
    agents: HashMap<String, AgentBinding>,
    tracking: HashMap<String, TrackedMessage>,
    stats: DeliveryStats,
}

impl BusState {
    fn queue_for(&self, agent_id: &str) -> Option<String> {
        self.agents.get(agent_id).map(|binding| binding.queue.clone())
    }

    fn record_delivery_latency(&mut self, sent_at: DateTime<Utc>, now: DateTime<Utc>) {
        let sample = (now - sent_at).num_milliseconds().max(0) as f64;
        self.stats.delivered += 1;
        let count = self.stats.delivered as f64;
        self.stats.average_delivery_ms += (sample - self.stats.average_delivery_ms) / count;
    }
}

struct BusInner {
    config: BusConfig,
    workers: WorkerConfig,
    protocol: MessageProtocol,
    store: Arc<dyn QueueStore>,
    directory: Arc<dyn AgentDirectory>,
    state: Mutex<BusState>,
    shutdown: CancellationToken,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Message bus routing typed messages between registered agents.
///
/// - four delivery modes over a pluggable queue store
/// - tracking table with a validated status lifecycle
/// - bounded retry, dead-lettering and expiry reconciliation
/// - dispatcher, retrier and reaper workers started by `initialize`
///
/// All registries live behind one mutex that is never held across an await.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("MessageBus")
            .field("agents", &state.agents.len())
            .field("tracked", &state.tracking.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MessageBus {
    pub fn new(
        config: &Config,
        store: Arc<dyn QueueStore>,
        directory: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config: config.bus.clone(),
                workers: config.workers.clone(),
                protocol: MessageProtocol::new(config.protocol.clone()),
                store,
                directory,
                state: Mutex::new(BusState::default()),
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn protocol(&self) -> &MessageProtocol {
        &self.inner.protocol
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.inner.workers
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Ping the store and start the dispatcher, retrier and reaper.
    pub async fn initialize(&self) -> Result<(), BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Store("bus has already been shut down".into()));
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::info!("Initializing message bus...");
        if let Err(error) = self.inner.store.ping().await {
            self.inner.running.store(false, Ordering::Release);
            tracing::error!("Failed to initialize message bus: {error}");
            return Err(BusError::Store(error.to_string()));
        }

        let handles = workers::spawn_all(self);
        self.inner.handles.lock().extend(handles);
        tracing::info!("Message bus initialized");
        Ok(())
    }

    /// Signal the workers, wait for them, then release the store.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        tracing::info!("Shutting down message bus...");
        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!("Bus worker did not stop cleanly: {error}");
            }
        }
        self.inner.running.store(false, Ordering::Release);

        self.inner
            .store
            .close()
            .await
            .map_err(|error| BusError::Store(error.to_string()))?;
        tracing::info!("Message bus shutdown complete");
        Ok(())
    }

    // ── Registration ────────────────────────────────────────────

    /// Bind a handler and queue to `agent_id`; re-registering replaces both.
    /// Returns the queue name in use.
    pub fn register_agent(
        &self,
        agent_id: &str,
        handler: Arc<dyn MessageHandler>,
        queue_name: Option<&str>,
    ) -> Result<String, BusError> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(BusError::EmptyAgentId);
        }
        let queue = queue_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(
                || format!("{}{agent_id}", self.inner.config.queue_prefix),
                str::to_string,
            );

        self.lock_state().agents.insert(
            agent_id.to_string(),
            AgentBinding {
                handler,
                queue: queue.clone(),
            },
        );
        tracing::info!("Registered agent {agent_id} with queue {queue}");
        Ok(queue)
    }

    /// Remove an agent binding. Items already in its queue stay there.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.lock_state().agents.remove(agent_id).is_some();
        if removed {
            tracing::info!("Unregistered agent {agent_id}");
        }
        removed
    }

    /// Snapshot registered agent ids, sorted.
    pub fn registered_agents(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut agents = state.agents.keys().cloned().collect::<Vec<_>>();
        agents.sort();
        agents
    }

    // ── Sending ─────────────────────────────────────────────────

    pub async fn send_message(
        &self,
        message: AgentMessage,
        mode: DeliveryMode,
    ) -> Result<SendReceipt, BusError> {
        let violations = self.inner.protocol.validate(&message);
        if !violations.is_empty() {
            tracing::warn!(
                message_id = %message.message_id,
                "Rejected invalid message: {}",
                violations.join("; ")
            );
            return Err(BusError::Validation {
                message_id: message.message_id,
                violations,
            });
        }

        tracing::info!(
            "Sending {} from {} to {} ({mode})",
            message.message_type,
            message.from_agent,
            message.to_agent
        );

        let outgoing = self.resolve_recipients(message, mode).await?;
        let mut message_ids = Vec::with_capacity(outgoing.len());
        let mut last_error = None;
        for copy in outgoing {
            match self.enqueue(copy).await {
                Ok(message_id) => message_ids.push(message_id),
                Err(error) => {
                    tracing::warn!("Enqueue failed: {error}");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if message_ids.is_empty() => Err(error),
            _ => Ok(SendReceipt { mode, message_ids }),
        }
    }

    async fn resolve_recipients(
        &self,
        message: AgentMessage,
        mode: DeliveryMode,
    ) -> Result<Vec<AgentMessage>, BusError> {
        let recipients = match mode {
            DeliveryMode::Direct => {
                if !self.lock_state().agents.contains_key(&message.to_agent) {
                    return Err(BusError::UnknownAgent {
                        agent: message.to_agent.clone(),
                        message_id: message.message_id.clone(),
                    });
                }
                return Ok(vec![message]);
            }
            DeliveryMode::Broadcast => self
                .registered_agents()
                .into_iter()
                .filter(|agent_id| *agent_id != message.from_agent)
                .collect::<Vec<_>>(),
            DeliveryMode::RoleBased => {
                let mut matches = Vec::new();
                for agent_id in self.registered_agents() {
                    if agent_id == message.from_agent {
                        continue;
                    }
                    let role = self
                        .inner
                        .directory
                        .resolve_role(&agent_id)
                        .await
                        .map_err(|error| BusError::Directory(error.to_string()))?;
                    if role.as_deref() == Some(message.to_agent.as_str()) {
                        matches.push(agent_id);
                    }
                }
                matches
            }
            DeliveryMode::ProjectBased => {
                let Some(project_id) = message.project_id.as_deref() else {
                    tracing::error!("Project-based message missing project_id");
                    return Err(BusError::MissingProjectId {
                        message_id: message.message_id.clone(),
                    });
                };
                let members = self
                    .inner
                    .directory
                    .members_of_project(project_id)
                    .await
                    .map_err(|error| BusError::Directory(error.to_string()))?
                    .into_iter()
                    .collect::<BTreeSet<_>>();
                let state = self.lock_state();
                members
                    .into_iter()
                    .filter(|agent_id| {
                        *agent_id != message.from_agent && state.agents.contains_key(agent_id)
                    })
                    .collect()
            }
        };

        if recipients.is_empty() {
            return Err(BusError::NoRecipients {
                message_id: message.message_id,
                mode,
            });
        }
        Ok(recipients
            .iter()
            .map(|agent_id| message.fan_out_copy(agent_id))
            .collect())
    }

    /// Track and push one message to its recipient's queue.
    async fn enqueue(&self, mut message: AgentMessage) -> Result<String, BusError> {
        message.max_delivery_attempts = message
            .max_delivery_attempts
            .min(self.inner.protocol.config().max_delivery_attempts);
        message.delivery_attempts = 0;
        message.status = MessageStatus::Pending;
        let message_id = message.message_id.clone();
        let to_agent = message.to_agent.clone();
        let item = self.encode_envelope(&message)?;

        let queue = {
            let mut state = self.lock_state();
            let queue = state
                .queue_for(&to_agent)
                .ok_or_else(|| BusError::UnknownAgent {
                    agent: to_agent.clone(),
                    message_id: message_id.clone(),
                })?;
            if state.tracking.contains_key(&message_id) {
                return Err(BusError::DuplicateMessageId { message_id });
            }
            state.tracking.insert(
                message_id.clone(),
                TrackedMessage {
                    message,
                    sent_at: Utc::now(),
                    delivery_attempts: 0,
                    status: MessageStatus::Pending,
                    dead_letter_pending: false,
                },
            );
            queue
        };

        if let Err(error) = self.inner.store.push(&queue, item).await {
            self.lock_state().tracking.remove(&message_id);
            return Err(BusError::Delivery {
                message_id,
                reason: error.to_string(),
            });
        }
        self.lock_state().stats.sent += 1;
        self.notify(&to_agent, &message_id).await;
        tracing::debug!("Queued message {message_id} on {queue}");
        Ok(message_id)
    }

    async fn notify(&self, agent_id: &str, message_id: &str) {
        let channel = format!("{}{agent_id}", self.inner.config.notify_prefix);
        if let Err(error) = self.inner.store.publish(&channel, message_id).await {
            tracing::debug!("Notification on {channel} dropped: {error}");
        }
    }

    fn encode_envelope(&self, message: &AgentMessage) -> Result<String, BusError> {
        let ttl = self.message_ttl();
        let envelope = QueuedEnvelope {
            message: message.to_json()?,
            priority: message.priority,
            expires_at: message.expires_at.unwrap_or_else(|| Utc::now() + ttl),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    // ── Receiving ───────────────────────────────────────────────

    /// Pop up to `max_messages` from the agent's queue, waiting up to `timeout`
    /// for each pop. Expired envelopes are dropped and never returned.
    pub async fn receive_messages(
        &self,
        agent_id: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<AgentMessage>, BusError> {
        let Some(queue) = self.lock_state().queue_for(agent_id) else {
            return Ok(Vec::new());
        };
        let queues = [queue];
        let mut received = Vec::new();

        for _ in 0..max_messages {
            let popped = match self.inner.store.pop_blocking(&queues, timeout).await {
                Ok(popped) => popped,
                Err(error) if received.is_empty() => {
                    return Err(BusError::Store(error.to_string()));
                }
                Err(error) => {
                    tracing::error!("Failed to receive messages for {agent_id}: {error}");
                    break;
                }
            };
            let Some((_, raw)) = popped else {
                break;
            };
            if let Some(message) = self.accept_envelope(agent_id, &raw) {
                received.push(message);
            }
        }

        Ok(received)
    }

    fn accept_envelope(&self, agent_id: &str, raw: &str) -> Option<AgentMessage> {
        let envelope = match serde_json::from_str::<QueuedEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!("Dropping undecodable envelope for {agent_id}: {error}");
                return None;
            }
        };
        if envelope.protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                "Envelope for {agent_id} carries protocol {} (local {PROTOCOL_VERSION})",
                envelope.protocol_version
            );
        }
        let mut message = match AgentMessage::from_json(&envelope.message) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!("Dropping undecodable message for {agent_id}: {error}");
                return None;
            }
        };

        let now = Utc::now();
        let mut state = self.lock_state();
        if now > envelope.expires_at || message.is_expired_at(now) {
            state.tracking.remove(&message.message_id);
            state.stats.expired += 1;
            tracing::debug!("Dropped expired message {}", message.message_id);
            return None;
        }

        if let Some(entry) = state.tracking.get_mut(&message.message_id) {
            if entry.status.can_transition_to(MessageStatus::Delivered) {
                entry.set_status(MessageStatus::Delivered);
                let sent_at = entry.sent_at;
                message.delivery_attempts = entry.delivery_attempts;
                state.record_delivery_latency(sent_at, now);
            }
        }
        message.status = MessageStatus::Delivered;
        Some(message)
    }

    /// Drain one batch for `agent_id` through its handler. Returns how many
    /// messages were processed successfully.
    pub async fn process_agent_messages(&self, agent_id: &str) -> Result<usize, BusError> {
        let Some(handler) = self
            .lock_state()
            .agents
            .get(agent_id)
            .map(|binding| Arc::clone(&binding.handler))
        else {
            return Ok(0);
        };

        let timeout = Duration::from_millis(self.inner.config.receive_timeout_ms);
        let messages = self
            .receive_messages(agent_id, self.inner.config.batch_size, timeout)
            .await?;

        let mut processed = 0;
        for message in messages {
            match handler.handle(agent_id, &message).await {
                Ok(reply) => {
                    if self.transition(&message.message_id, MessageStatus::Processed) {
                        self.lock_state().stats.processed += 1;
                    }
                    processed += 1;
                    self.follow_up(agent_id, &message, reply).await;
                }
                Err(error) => {
                    tracing::warn!("Error processing message {}: {error}", message.message_id);
                    self.transition(&message.message_id, MessageStatus::Failed);
                }
            }
        }
        Ok(processed)
    }

    async fn follow_up(&self, agent_id: &str, message: &AgentMessage, reply: Option<AgentMessage>) {
        let outgoing = match reply {
            Some(reply) => reply,
            None if message.requires_response => {
                let mut payload = Payload::new();
                payload.insert("status".into(), json!("received"));
                payload.insert("processed".into(), json!(true));
                message.create_reply(agent_id, MessageType::StatusUpdate, payload)
            }
            None => return,
        };

        if let Err(error) = self.send_message(outgoing, DeliveryMode::Direct).await {
            tracing::warn!(
                "Reply to message {} from {agent_id} was not sent: {error}",
                message.message_id
            );
        }
    }

    /// Apply a lifecycle transition; illegal or untracked transitions are ignored.
    fn transition(&self, message_id: &str, next: MessageStatus) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.tracking.get_mut(message_id) else {
            return false;
        };
        if !entry.status.can_transition_to(next) {
            tracing::debug!(
                "Ignoring transition {} -> {next} for message {message_id}",
                entry.status
            );
            return false;
        }
        entry.set_status(next);
        true
    }

    /// Mark a delivered message as read without completing it.
    pub fn mark_message_read(&self, message_id: &str) -> bool {
        self.transition(message_id, MessageStatus::Read)
    }

    // ── Reconciliation ──────────────────────────────────────────

    /// One dispatcher sweep over every registered agent. Per-agent failures
    /// are logged and do not stop the sweep; no new batch starts after shutdown.
    pub async fn dispatch_once(&self) -> DispatchSweep {
        let mut sweep = DispatchSweep::default();
        for agent_id in self.registered_agents() {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            sweep.agents += 1;
            match self.process_agent_messages(&agent_id).await {
                Ok(processed) => sweep.processed += processed,
                Err(error) => {
                    sweep.failed_agents += 1;
                    tracing::error!("Error processing messages for {agent_id}: {error}");
                }
            }
        }
        sweep
    }

    /// One retry sweep over failed tracked messages.
    pub async fn retry_failed_once(&self) -> RetrySweep {
        let now = Utc::now();
        let mut sweep = RetrySweep::default();
        let mut redeliveries = Vec::new();
        let mut exhausted = Vec::new();

        {
            let mut state = self.lock_state();
            let failed = state
                .tracking
                .iter()
                .filter(|(_, entry)| {
                    entry.status == MessageStatus::Failed && !entry.dead_letter_pending
                })
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();

            for message_id in failed {
                let Some(entry) = state.tracking.get(&message_id) else {
                    continue;
                };
                if entry.message.is_expired_at(now) {
                    state.tracking.remove(&message_id);
                    state.stats.expired += 1;
                    sweep.expired += 1;
                    continue;
                }
                let exhausted_attempts = !entry.message.should_retry_delivery();
                let queue = state.queue_for(&entry.message.to_agent);
                let Some(entry) = state.tracking.get_mut(&message_id) else {
                    continue;
                };
                if exhausted_attempts {
                    // Stays tracked as `failed` until the dead-letter push lands.
                    entry.dead_letter_pending = true;
                    exhausted.push(entry.message.clone());
                    continue;
                }

                // Reserve the attempt before pushing so a concurrent pop sees `pending`.
                entry.delivery_attempts += 1;
                entry.message.delivery_attempts = entry.delivery_attempts;
                entry.set_status(MessageStatus::Pending);
                redeliveries.push((queue, entry.message.clone()));
            }
        }

        for (queue, message) in redeliveries {
            match self.redeliver(queue.as_deref(), &message).await {
                Ok(()) => {
                    sweep.requeued += 1;
                    tracing::info!(
                        "Retried message {} (attempt {}/{})",
                        message.message_id,
                        message.delivery_attempts,
                        message.max_delivery_attempts
                    );
                }
                Err(error) => {
                    sweep.redelivery_failed += 1;
                    self.transition(&message.message_id, MessageStatus::Failed);
                    tracing::warn!("Retry of message {} failed: {error}", message.message_id);
                }
            }
        }

        for message in exhausted {
            let message_id = message.message_id.clone();
            match self
                .move_to_dead_letter(message, RETRY_EXHAUSTED_REASON)
                .await
            {
                Ok(()) => {
                    let mut state = self.lock_state();
                    state.tracking.remove(&message_id);
                    state.stats.failed += 1;
                    sweep.dead_lettered += 1;
                }
                Err(error) => {
                    if let Some(entry) = self.lock_state().tracking.get_mut(&message_id) {
                        entry.dead_letter_pending = false;
                    }
                    sweep.dead_letter_failed += 1;
                    tracing::error!("Failed to dead-letter message {message_id}: {error}");
                }
            }
        }

        sweep
    }

    async fn redeliver(&self, queue: Option<&str>, message: &AgentMessage) -> Result<(), BusError> {
        let Some(queue) = queue else {
            return Err(BusError::UnknownAgent {
                agent: message.to_agent.clone(),
                message_id: message.message_id.clone(),
            });
        };
        let item = self.encode_envelope(message)?;
        self.inner
            .store
            .push(queue, item)
            .await
            .map_err(|error| BusError::Delivery {
                message_id: message.message_id.clone(),
                reason: error.to_string(),
            })?;
        self.notify(&message.to_agent, &message.message_id).await;
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        mut message: AgentMessage,
        reason: &str,
    ) -> Result<(), BusError> {
        message.status = MessageStatus::Failed;
        let message_id = message.message_id.clone();
        let entry = DeadLetterEntry {
            message: message.to_json()?,
            failed_at: Utc::now(),
            reason: reason.to_string(),
        };
        let item = serde_json::to_string(&entry)?;

        self.inner
            .store
            .push(&self.inner.config.dead_letter_queue, item)
            .await
            .map_err(|error| BusError::Delivery {
                message_id: message_id.clone(),
                reason: error.to_string(),
            })?;
        tracing::warn!("Moved message {message_id} to dead letter queue");
        Ok(())
    }

    /// Remove tracked entries past their deadline: the message's `expires_at`,
    /// else `sent_at` plus the message TTL. `failed` entries without an explicit
    /// expiry are left to the retrier. Returns how many entries were removed.
    pub fn reap_expired_once(&self) -> usize {
        let now = Utc::now();
        let ttl = self.message_ttl();

        let mut state = self.lock_state();
        let before = state.tracking.len();
        let mut expired = 0u64;
        state.tracking.retain(|_, entry| {
            if entry.dead_letter_pending {
                return true;
            }
            if entry.message.is_expired_at(now) {
                expired += 1;
                return false;
            }
            if entry.message.expires_at.is_some()
                || entry.status == MessageStatus::Failed
                || now - entry.sent_at <= ttl
            {
                return true;
            }
            if entry.status != MessageStatus::Processed {
                expired += 1;
            }
            false
        });
        state.stats.expired += expired;
        let removed = before - state.tracking.len();
        drop(state);

        if removed > 0 {
            tracing::info!("Cleaned up {removed} expired messages");
        }
        removed
    }

    // ── Introspection ───────────────────────────────────────────

    pub fn get_message_status(&self, message_id: &str) -> Option<MessageStatusReport> {
        let state = self.lock_state();
        let entry = state.tracking.get(message_id)?;
        Some(MessageStatusReport {
            message_id: message_id.to_string(),
            status: entry.status,
            sent_at: entry.sent_at,
            delivery_attempts: entry.delivery_attempts,
            from_agent: entry.message.from_agent.clone(),
            to_agent: entry.message.to_agent.clone(),
            message_type: entry.message.message_type,
        })
    }

    /// Pending queue depth for an agent; `0` when the agent is not registered.
    pub async fn get_agent_queue_size(&self, agent_id: &str) -> Result<usize, BusError> {
        let Some(queue) = self.lock_state().queue_for(agent_id) else {
            return Ok(0);
        };
        self.inner
            .store
            .length(&queue)
            .await
            .map_err(|error| BusError::Store(error.to_string()))
    }

    pub async fn dead_letter_count(&self) -> Result<usize, BusError> {
        self.inner
            .store
            .length(&self.inner.config.dead_letter_queue)
            .await
            .map_err(|error| BusError::Store(error.to_string()))
    }

    pub async fn get_bus_statistics(&self) -> Result<BusStatistics, BusError> {
        let (registered_agents, queues, tracked_messages, delivery_stats) = {
            let state = self.lock_state();
            let queues = state
                .agents
                .iter()
                .map(|(agent_id, binding)| (agent_id.clone(), binding.queue.clone()))
                .collect::<Vec<_>>();
            (
                state.agents.len(),
                queues,
                state.tracking.len(),
                state.stats,
            )
        };

        let active_queues = queues
            .iter()
            .map(|(_, queue)| queue.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let mut queue_sizes = BTreeMap::new();
        for (agent_id, queue) in &queues {
            let size = self
                .inner
                .store
                .length(queue)
                .await
                .map_err(|error| BusError::Store(error.to_string()))?;
            queue_sizes.insert(agent_id.clone(), size);
        }

        Ok(BusStatistics {
            registered_agents,
            active_queues,
            tracked_messages,
            delivery_stats,
            queue_sizes,
        })
    }

    fn message_ttl(&self) -> ChronoDuration {
        let secs = self.inner.config.message_ttl_secs.min(MAX_MESSAGE_TTL_SECS);
        ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::directory::StaticAgentDirectory;
    use crate::coordination::handler::HandlerTable;
    use crate::coordination::store::InMemoryQueueStore;

    const QUICK: Duration = Duration::from_millis(20);

    fn quiet_handler() -> Arc<dyn MessageHandler> {
        Arc::new(HandlerTable::new())
    }

    fn bus_with(store: &InMemoryQueueStore, directory: StaticAgentDirectory) -> MessageBus {
        let mut config = Config::default();
        config.bus.receive_timeout_ms = 20;
        MessageBus::new(&config, Arc::new(store.clone()), Arc::new(directory))
    }

    fn status_update(from: &str, to: &str) -> AgentMessage {
        AgentMessage::new(from, to, MessageType::StatusUpdate, Payload::new())
    }

    #[tokio::test]
    async fn register_uses_default_and_custom_queue_names() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());

        let default_queue = bus
            .register_agent("dev-1", quiet_handler(), None)
            .expect("register");
        assert_eq!(default_queue, "agent_queue_dev-1");
        let custom = bus
            .register_agent("qa-1", quiet_handler(), Some("qa_inbox"))
            .expect("register");
        assert_eq!(custom, "qa_inbox");

        // Idempotent re-registration keeps a single binding.
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("re-register");
        assert_eq!(bus.registered_agents(), vec!["dev-1", "qa-1"]);
        assert_eq!(
            bus.register_agent("  ", quiet_handler(), None),
            Err(BusError::EmptyAgentId)
        );
    }

    #[tokio::test]
    async fn direct_send_enqueues_exactly_one_envelope() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("register");

        let message = status_update("pm-1", "dev-1");
        let receipt = bus
            .send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect("send");
        assert_eq!(receipt.message_ids, vec![message.message_id.clone()]);
        assert_eq!(bus.get_agent_queue_size("dev-1").await.expect("size"), 1);

        let raw = store.peek("agent_queue_dev-1", 0);
        let envelope: QueuedEnvelope = serde_json::from_str(&raw[0]).expect("envelope");
        assert_eq!(envelope.priority, MessagePriority::Medium);
        let queued = AgentMessage::from_json(&envelope.message).expect("message");
        assert_eq!(queued.message_id, message.message_id);

        let status = bus
            .get_message_status(&message.message_id)
            .expect("tracked");
        assert_eq!(status.status, MessageStatus::Pending);
        assert_eq!(status.delivery_attempts, 0);
    }

    #[tokio::test]
    async fn unknown_direct_target_is_a_routing_error_and_untracked() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        let message = status_update("pm-1", "ghost");

        let error = bus
            .send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect_err("unknown target");
        assert!(error.is_routing());
        assert!(bus.get_message_status(&message.message_id).is_none());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("register");
        let message = status_update("pm-1", "dev-1");

        bus.send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect("first send");
        let error = bus
            .send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect_err("duplicate");
        assert_eq!(
            error,
            BusError::DuplicateMessageId {
                message_id: message.message_id
            }
        );
        assert_eq!(bus.get_agent_queue_size("dev-1").await.expect("size"), 1);
    }

    #[tokio::test]
    async fn role_based_delivery_uses_directory_roles() {
        let store = InMemoryQueueStore::new();
        let directory = StaticAgentDirectory::new();
        directory.set_role("dev-1", "developer");
        directory.set_role("dev-2", "developer");
        directory.set_role("qa-1", "qa");
        let bus = bus_with(&store, directory);
        for agent in ["dev-1", "dev-2", "qa-1"] {
            bus.register_agent(agent, quiet_handler(), None)
                .expect("register");
        }

        let receipt = bus
            .send_message(status_update("pm-1", "developer"), DeliveryMode::RoleBased)
            .await
            .expect("send");
        assert_eq!(receipt.delivered_to(), 2);
        assert_eq!(bus.get_agent_queue_size("dev-1").await.expect("size"), 1);
        assert_eq!(bus.get_agent_queue_size("dev-2").await.expect("size"), 1);
        assert_eq!(bus.get_agent_queue_size("qa-1").await.expect("size"), 0);

        let error = bus
            .send_message(status_update("pm-1", "designer"), DeliveryMode::RoleBased)
            .await
            .expect_err("nobody has that role");
        assert!(matches!(error, BusError::NoRecipients { .. }));
    }

    #[tokio::test]
    async fn project_based_delivery_requires_project_and_skips_sender() {
        let store = InMemoryQueueStore::new();
        let directory = StaticAgentDirectory::new();
        directory.assign_project("pm-1", "hotel");
        directory.assign_project("dev-1", "hotel");
        directory.assign_project("qa-1", "billing");
        directory.assign_project("offline-1", "hotel");
        let bus = bus_with(&store, directory);
        for agent in ["pm-1", "dev-1", "qa-1"] {
            bus.register_agent(agent, quiet_handler(), None)
                .expect("register");
        }

        let error = bus
            .send_message(status_update("pm-1", "*"), DeliveryMode::ProjectBased)
            .await
            .expect_err("missing project");
        assert!(matches!(error, BusError::MissingProjectId { .. }));

        let receipt = bus
            .send_message(
                status_update("pm-1", "*").with_project("hotel"),
                DeliveryMode::ProjectBased,
            )
            .await
            .expect("send");
        assert_eq!(receipt.delivered_to(), 1);
        assert_eq!(bus.get_agent_queue_size("dev-1").await.expect("size"), 1);
        assert_eq!(bus.get_agent_queue_size("pm-1").await.expect("size"), 0);
    }

    #[tokio::test]
    async fn receive_marks_delivered_and_updates_stats() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("register");
        let message = status_update("pm-1", "dev-1");
        bus.send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect("send");

        let received = bus
            .receive_messages("dev-1", 5, QUICK)
            .await
            .expect("receive");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].status, MessageStatus::Delivered);
        assert_eq!(
            bus.get_message_status(&message.message_id)
                .expect("tracked")
                .status,
            MessageStatus::Delivered
        );
        assert!(bus.mark_message_read(&message.message_id));

        let stats = bus.get_bus_statistics().await.expect("stats");
        assert_eq!(stats.delivery_stats.sent, 1);
        assert_eq!(stats.delivery_stats.delivered, 1);
        assert_eq!(stats.queue_sizes["dev-1"], 0);

        let unknown = bus
            .receive_messages("ghost", 5, QUICK)
            .await
            .expect("receive");
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn expired_envelope_is_dropped_and_untracked() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("register");
        let message = status_update("pm-1", "dev-1")
            .with_expiry(Utc::now() + ChronoDuration::milliseconds(30));
        bus.send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect("send");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let received = bus
            .receive_messages("dev-1", 5, QUICK)
            .await
            .expect("receive");
        assert!(received.is_empty());
        assert!(bus.get_message_status(&message.message_id).is_none());
        let stats = bus.get_bus_statistics().await.expect("stats");
        assert_eq!(stats.delivery_stats.expired, 1);
        assert_eq!(stats.delivery_stats.delivered, 0);
    }

    #[tokio::test]
    async fn reaper_purges_expired_entries_regardless_of_status() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("register");
        let short = status_update("pm-1", "dev-1")
            .with_expiry(Utc::now() + ChronoDuration::milliseconds(30));
        let long = status_update("pm-1", "dev-1");
        bus.send_message(short.clone(), DeliveryMode::Direct)
            .await
            .expect("send");
        bus.send_message(long.clone(), DeliveryMode::Direct)
            .await
            .expect("send");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(bus.reap_expired_once(), 1);
        assert!(bus.get_message_status(&short.message_id).is_none());
        assert!(bus.get_message_status(&long.message_id).is_some());
    }

    #[tokio::test]
    async fn illegal_transitions_are_ignored() {
        let store = InMemoryQueueStore::new();
        let bus = bus_with(&store, StaticAgentDirectory::new());
        bus.register_agent("dev-1", quiet_handler(), None)
            .expect("register");
        let message = status_update("pm-1", "dev-1");
        bus.send_message(message.clone(), DeliveryMode::Direct)
            .await
            .expect("send");

        assert!(!bus.transition(&message.message_id, MessageStatus::Processed));
        assert!(!bus.mark_message_read(&message.message_id));
        assert!(!bus.transition("missing", MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn initialize_fails_fast_when_store_is_unreachable() {
        let store = InMemoryQueueStore::new();
        store.close().await.expect("close");
        let bus = bus_with(&store, StaticAgentDirectory::new());

        let error = bus.initialize().await.expect_err("closed store");
        assert!(matches!(error, BusError::Store(_)));
        assert!(!bus.is_running());
    }
}

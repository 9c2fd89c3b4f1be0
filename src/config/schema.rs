use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Top-level teambus configuration, loaded from `config.toml`.
///
/// Resolution order: `TEAMBUS_CONFIG_DIR` env → `~/.teambus/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Message bus routing and queue naming (`[bus]`).
    #[serde(default)]
    pub bus: BusConfig,

    /// Message construction and validation limits (`[protocol]`).
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Background worker cadence (`[workers]`).
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Team roster (`[[agents]]`). Feeds the agent directory and daemon registrations.
    #[serde(default)]
    pub agents: Vec<AgentEntryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            bus: BusConfig::default(),
            protocol: ProtocolConfig::default(),
            workers: WorkerConfig::default(),
            agents: Vec::new(),
        }
    }
}

// ── Bus ─────────────────────────────────────────────────────────

/// Upper bound for `bus.message_ttl_secs` (30 days).
pub const MAX_MESSAGE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Message bus configuration (`[bus]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct BusConfig {
    /// Lifetime of a queued envelope when the message carries no `expires_at`. Default: `3600`.
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Prefix for per-agent queue names. Default: `"agent_queue_"`.
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
    /// Prefix for per-agent notification channels. Default: `"notify_"`.
    #[serde(default = "default_notify_prefix")]
    pub notify_prefix: String,
    /// Queue holding dead-lettered messages. Default: `"dead_letter_queue"`.
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    /// Messages drained per agent per dispatch sweep. Default: `20`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Blocking pop timeout used by the dispatcher, in milliseconds. Default: `250`.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

fn default_message_ttl_secs() -> u64 {
    3600
}

fn default_queue_prefix() -> String {
    "agent_queue_".into()
}

fn default_notify_prefix() -> String {
    "notify_".into()
}

fn default_dead_letter_queue() -> String {
    "dead_letter_queue".into()
}

fn default_batch_size() -> usize {
    20
}

fn default_receive_timeout_ms() -> u64 {
    250
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_ttl_secs: default_message_ttl_secs(),
            queue_prefix: default_queue_prefix(),
            notify_prefix: default_notify_prefix(),
            dead_letter_queue: default_dead_letter_queue(),
            batch_size: default_batch_size(),
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

// ── Protocol ────────────────────────────────────────────────────

/// Message protocol configuration (`[protocol]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Maximum serialized message size in bytes. Default: `1048576` (1 MiB).
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: usize,
    /// Response timeout stamped on task assignments, in seconds. Default: `300`.
    #[serde(default = "default_response_timeout_secs")]
    pub default_response_timeout_secs: u64,
    /// Delivery attempts before a failed message is dead-lettered. Default: `3`.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Agent receiving conflict reports. Default: `"manager-001"`.
    #[serde(default = "default_escalation_agent")]
    pub escalation_agent: String,
}

fn default_max_message_size_bytes() -> usize {
    1024 * 1024
}

fn default_response_timeout_secs() -> u64 {
    300
}

fn default_max_delivery_attempts() -> u32 {
    crate::coordination::DEFAULT_MAX_DELIVERY_ATTEMPTS
}

fn default_escalation_agent() -> String {
    "manager-001".into()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size_bytes: default_max_message_size_bytes(),
            default_response_timeout_secs: default_response_timeout_secs(),
            max_delivery_attempts: default_max_delivery_attempts(),
            escalation_agent: default_escalation_agent(),
        }
    }
}

// ── Workers ─────────────────────────────────────────────────────

/// Background worker configuration (`[workers]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Pause between dispatcher sweeps, in milliseconds. Default: `1000`.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Pause after a failed dispatcher sweep, in milliseconds. Default: `5000`.
    #[serde(default = "default_dispatch_error_backoff_ms")]
    pub dispatch_error_backoff_ms: u64,
    /// Interval between retry sweeps, in seconds. Default: `30`.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Interval between expiry sweeps, in seconds. Default: `300`.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Interval at which the daemon flushes bus statistics to disk, in seconds. Default: `5`.
    #[serde(default = "default_state_flush_secs")]
    pub state_flush_secs: u64,
}

fn default_dispatch_interval_ms() -> u64 {
    1000
}

fn default_dispatch_error_backoff_ms() -> u64 {
    5000
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_reap_interval_secs() -> u64 {
    300
}

fn default_state_flush_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval_ms(),
            dispatch_error_backoff_ms: default_dispatch_error_backoff_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            state_flush_secs: default_state_flush_secs(),
        }
    }
}

// ── Agents ──────────────────────────────────────────────────────

/// One team member (`[[agents]]` entry).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct AgentEntryConfig {
    /// Stable agent id (e.g. `"dev-1"`).
    pub id: String,
    /// Role name used by role-based delivery (e.g. `"developer"`).
    pub role: String,
    /// Projects this agent works on; used by project-based delivery.
    #[serde(default)]
    pub projects: Vec<String>,
    /// Custom queue name. Default: `<bus.queue_prefix><id>`.
    #[serde(default)]
    pub queue: Option<String>,
}

// ── Loading ─────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".teambus"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    if let Ok(custom_config_dir) = std::env::var("TEAMBUS_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            return Ok(PathBuf::from(custom_config_dir));
        }
    }
    default_config_dir()
}

impl Config {
    /// Load `config.toml` from the resolved config directory, writing defaults
    /// when the file does not exist yet.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        Self::load_or_init_in(&config_dir).await
    }

    pub async fn load_or_init_in(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            agents = config.agents.len(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Bus
        if self.bus.message_ttl_secs == 0 {
            anyhow::bail!("bus.message_ttl_secs must be greater than 0");
        }
        if self.bus.message_ttl_secs > MAX_MESSAGE_TTL_SECS {
            anyhow::bail!("bus.message_ttl_secs must be at most {MAX_MESSAGE_TTL_SECS}");
        }
        if self.bus.queue_prefix.trim().is_empty() {
            anyhow::bail!("bus.queue_prefix must not be empty");
        }
        if self.bus.dead_letter_queue.trim().is_empty() {
            anyhow::bail!("bus.dead_letter_queue must not be empty");
        }
        if self.bus.batch_size == 0 {
            anyhow::bail!("bus.batch_size must be greater than 0");
        }

        // Protocol
        if self.protocol.max_message_size_bytes == 0 {
            anyhow::bail!("protocol.max_message_size_bytes must be greater than 0");
        }
        if self.protocol.max_delivery_attempts == 0 {
            anyhow::bail!("protocol.max_delivery_attempts must be greater than 0");
        }
        if self.protocol.escalation_agent.trim().is_empty() {
            anyhow::bail!("protocol.escalation_agent must not be empty");
        }

        // Workers
        if self.workers.dispatch_interval_ms == 0 {
            anyhow::bail!("workers.dispatch_interval_ms must be greater than 0");
        }
        if self.workers.retry_interval_secs == 0 {
            anyhow::bail!("workers.retry_interval_secs must be greater than 0");
        }
        if self.workers.reap_interval_secs == 0 {
            anyhow::bail!("workers.reap_interval_secs must be greater than 0");
        }

        // Agents
        let mut seen = HashSet::new();
        for (i, agent) in self.agents.iter().enumerate() {
            if agent.id.trim().is_empty() {
                anyhow::bail!("agents[{i}].id must not be empty");
            }
            if agent.role.trim().is_empty() {
                anyhow::bail!("agents[{i}].role must not be empty");
            }
            if agent.id == self.bus.dead_letter_queue
                || agent.queue.as_deref() == Some(self.bus.dead_letter_queue.as_str())
            {
                anyhow::bail!("agents[{i}] collides with bus.dead_letter_queue");
            }
            if !seen.insert(agent.id.as_str()) {
                anyhow::bail!("agents[{i}].id is duplicated ({})", agent.id);
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(ttl) = env_number::<u64>("TEAMBUS_MESSAGE_TTL_SECS") {
            self.bus.message_ttl_secs = ttl;
        }
        if let Some(bytes) = env_number::<usize>("TEAMBUS_MAX_MESSAGE_BYTES") {
            self.protocol.max_message_size_bytes = bytes;
        }
        if let Some(attempts) = env_number::<u32>("TEAMBUS_MAX_DELIVERY_ATTEMPTS") {
            self.protocol.max_delivery_attempts = attempts;
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {name}={trimmed}: not a valid number");
            None
        }
    }
}

use crate::config::Config;
use crate::coordination::{
    AgentMessage, HandlerTable, InMemoryQueueStore, MessageBus, StaticAgentDirectory,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run the configured team on an in-process store until Ctrl+C.
pub async fn run(config: Config) -> Result<()> {
    let bus = build_bus(&config)?;
    bus.initialize()
        .await
        .context("Failed to start message bus")?;

    let shutdown = CancellationToken::new();
    let writer = spawn_state_writer(&config, bus.clone(), shutdown.clone());

    println!("📨 teambus daemon started");
    println!("   Agents:  {}", bus.registered_agents().join(", "));
    println!("   State:   {}", state_file_path(&config).display());
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    if let Err(error) = writer.await {
        tracing::warn!("Daemon state writer did not stop cleanly: {error}");
    }
    bus.shutdown().await.context("Message bus shutdown failed")?;
    Ok(())
}

/// Bus with every `[[agents]]` entry registered behind a logging handler.
pub fn build_bus(config: &Config) -> Result<MessageBus> {
    let directory = Arc::new(StaticAgentDirectory::from_config(&config.agents));
    let bus = MessageBus::new(config, Arc::new(InMemoryQueueStore::new()), directory);

    for agent in &config.agents {
        bus.register_agent(&agent.id, Arc::new(logging_handler()), agent.queue.as_deref())
            .with_context(|| format!("Failed to register agent {}", agent.id))?;
    }
    if config.agents.is_empty() {
        tracing::warn!("No [[agents]] configured; the bus has nobody to deliver to");
    }
    Ok(bus)
}

fn logging_handler() -> HandlerTable {
    HandlerTable::new().fallback(|agent_id, message| async move {
        tracing::info!(
            agent = %agent_id,
            message_id = %message.message_id,
            from = %message.from_agent,
            "Received {}",
            message.message_type
        );
        anyhow::Ok(None::<AgentMessage>)
    })
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

fn spawn_state_writer(
    config: &Config,
    bus: MessageBus,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let path = state_file_path(config);
    let flush_every = Duration::from_secs(config.workers.state_flush_secs.max(1));

    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(flush_every);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = write_state(&bus, &path).await {
                tracing::warn!("Failed to write daemon state: {e}");
            }
        }
        // Final snapshot so the file reflects the state at shutdown.
        if let Err(e) = write_state(&bus, &path).await {
            tracing::warn!("Failed to write daemon state: {e}");
        }
    })
}

async fn write_state(bus: &MessageBus, path: &Path) -> Result<()> {
    let stats = bus.get_bus_statistics().await?;
    let mut json = serde_json::to_value(&stats)?;
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "written_at".into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    let data = serde_json::to_vec_pretty(&json)?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentEntryConfig;
    use crate::coordination::{DeliveryMode, MessageType, Payload};
    use tempfile::TempDir;

    fn team_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.config_path = dir.path().join("config.toml");
        config.bus.receive_timeout_ms = 10;
        config.agents = vec![
            AgentEntryConfig {
                id: "pm-1".into(),
                role: "project_manager".into(),
                projects: vec!["hotel".into()],
                queue: None,
            },
            AgentEntryConfig {
                id: "dev-1".into(),
                role: "developer".into(),
                projects: vec!["hotel".into()],
                queue: Some("dev_inbox".into()),
            },
        ];
        config
    }

    #[test]
    fn state_file_sits_next_to_config() {
        let mut config = Config::default();
        config.config_path = PathBuf::from("/tmp/teambus/config.toml");
        assert_eq!(
            state_file_path(&config),
            PathBuf::from("/tmp/teambus/daemon_state.json")
        );
    }

    #[tokio::test]
    async fn build_bus_registers_configured_team() {
        let tmp = TempDir::new().expect("tempdir");
        let config = team_config(&tmp);
        let bus = build_bus(&config).expect("bus");
        assert_eq!(bus.registered_agents(), vec!["dev-1", "pm-1"]);

        let message = AgentMessage::new("pm-1", "developer", MessageType::Heartbeat, Payload::new());
        let receipt = bus
            .send_message(message, DeliveryMode::RoleBased)
            .await
            .expect("role delivery");
        assert_eq!(receipt.delivered_to(), 1);
        assert_eq!(bus.get_agent_queue_size("dev-1").await.expect("size"), 1);
        assert_eq!(bus.process_agent_messages("dev-1").await.expect("process"), 1);
    }

    #[tokio::test]
    async fn write_state_flushes_statistics_json() {
        let tmp = TempDir::new().expect("tempdir");
        let config = team_config(&tmp);
        let bus = build_bus(&config).expect("bus");
        let path = state_file_path(&config);

        write_state(&bus, &path).await.expect("write state");
        let raw = tokio::fs::read_to_string(&path).await.expect("read state");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(json["registered_agents"], 2);
        assert!(json["written_at"].is_string());
        assert_eq!(json["delivery_stats"]["sent"], 0);
    }

    #[tokio::test]
    async fn state_writer_stops_cleanly_with_final_snapshot() {
        let tmp = TempDir::new().expect("tempdir");
        let mut config = team_config(&tmp);
        config.workers.state_flush_secs = 3600;
        let bus = build_bus(&config).expect("bus");
        let shutdown = CancellationToken::new();

        let writer = spawn_state_writer(&config, bus.clone(), shutdown.clone());
        let message = AgentMessage::new("pm-1", "dev-1", MessageType::Heartbeat, Payload::new());
        bus.send_message(message, DeliveryMode::Direct)
            .await
            .expect("send");
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer stops")
            .expect("writer task joins");

        let raw = tokio::fs::read_to_string(state_file_path(&config))
            .await
            .expect("read state");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(json["delivery_stats"]["sent"], 1);
    }
}

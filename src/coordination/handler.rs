use super::message::{AgentMessage, MessageType};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Per-agent message callback supplied by the application layer.
///
/// Returning `Ok(Some(reply))` sends the reply directly to its `to_agent`.
/// Returning an error marks the message failed and makes it eligible for retry,
/// so implementations must be idempotent with respect to `message_id`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, agent_id: &str, message: &AgentMessage) -> Result<Option<AgentMessage>>;
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<AgentMessage>>> + Send>>;

type Route = Arc<dyn Fn(String, AgentMessage) -> HandlerFuture + Send + Sync>;

fn boxed_route<F, Fut>(handler: F) -> Route
where
    F: Fn(String, AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<AgentMessage>>> + Send + 'static,
{
    Arc::new(move |agent_id, message| Box::pin(handler(agent_id, message)))
}

/// Closed dispatch table from `MessageType` to a handler function.
///
/// Types without a route go to the fallback; without a fallback they are
/// logged and acknowledged with no reply.
#[derive(Clone, Default)]
pub struct HandlerTable {
    routes: HashMap<MessageType, Route>,
    fallback: Option<Route>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("routes", &self.supported_types())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, message_type: MessageType, handler: F) -> Self
    where
        F: Fn(String, AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AgentMessage>>> + Send + 'static,
    {
        self.routes.insert(message_type, boxed_route(handler));
        self
    }

    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String, AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AgentMessage>>> + Send + 'static,
    {
        self.fallback = Some(boxed_route(handler));
        self
    }

    /// Routed types in wire-name order.
    pub fn supported_types(&self) -> Vec<MessageType> {
        let mut types = self.routes.keys().copied().collect::<Vec<_>>();
        types.sort_by_key(|kind| kind.as_str());
        types
    }
}

#[async_trait]
impl MessageHandler for HandlerTable {
    async fn handle(&self, agent_id: &str, message: &AgentMessage) -> Result<Option<AgentMessage>> {
        let route = self
            .routes
            .get(&message.message_type)
            .or(self.fallback.as_ref())
            .cloned();

        match route {
            Some(route) => route(agent_id.to_string(), message.clone()).await,
            None => {
                tracing::warn!(
                    agent = agent_id,
                    message_id = %message.message_id,
                    "Unsupported message type: {}",
                    message.message_type
                );
                Ok(None)
            }
        }
    }
}

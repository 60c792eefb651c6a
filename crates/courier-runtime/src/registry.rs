//! Command registry: in-memory handler lookup by message header.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use courier_core::{CourierError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::message::{MessageHeader, ServiceMessage};
use crate::traits::CommandResolver;

/// Handler body. `Some(payload)` becomes a `200` reply when the request
/// carries a response route.
pub type CommandHandler = Arc<dyn Fn(ServiceMessage) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// [`CommandResolver`] backed by a map from [`MessageHeader::key`] to handler.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same header.
    pub fn register<F, Fut>(&self, header: MessageHeader, handler: F)
    where
        F: Fn(ServiceMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let key = header.key();
        tracing::debug!("🔧 Handler registered: {key}");
        let handler: CommandHandler = Arc::new(move |message| handler(message).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler);
    }

    pub fn unregister(&self, header: &MessageHeader) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&header.key())
            .is_some()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, header: &MessageHeader) -> Option<CommandHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&header.key())
            .cloned()
    }
}

#[async_trait]
impl CommandResolver for CommandRegistry {
    fn supports(&self, header: &MessageHeader) -> bool {
        self.find(header).is_some()
    }

    async fn execute(&self, envelope: &Envelope, responses: &mut Vec<Envelope>) -> Result<bool> {
        let header = &envelope.message().header;
        let Some(handler) = self.find(header) else {
            return Ok(false);
        };

        let reply = handler(envelope.message().clone())
            .await
            .map_err(|e| CourierError::Handler(format!("{header}: {e:#}")))?;

        match reply {
            Some(payload) if envelope.can_respond() => {
                let mut response = envelope.to_response();
                let message = response.message_mut();
                message.payload = payload;
                message.status = Some("200".to_string());
                message.status_description = Some("OK".to_string());
                responses.push(response);
            }
            Some(_) => tracing::debug!("Reply from {header} dropped: no response route"),
            None => {}
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader::new("Orders", "order", "create")
    }

    #[test]
    fn test_register_and_lookup_ignores_case() {
        let registry = CommandRegistry::new();
        registry.register(header(), |_| async { Ok(None) });

        assert!(registry.supports(&MessageHeader::new("orders", "ORDER", "create")));
        assert!(!registry.supports(&MessageHeader::new("orders", "order", "delete")));
        assert_eq!(registry.keys(), vec!["orders/order/create"]);

        assert!(registry.unregister(&header()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_builds_reply() {
        let registry = CommandRegistry::new();
        registry.register(header(), |msg: ServiceMessage| async move { Ok(Some(msg.payload)) });

        let message = ServiceMessage::new(header(), serde_json::json!({"sku": "A1"}))
            .with_response(MessageHeader::new("client", "order", "created"));
        let env = Envelope::from_message(message);
        let mut responses = Vec::new();

        assert!(registry.execute(&env, &mut responses).await.unwrap());
        assert_eq!(responses.len(), 1);
        let reply = responses[0].message();
        assert_eq!(reply.header.channel_id, "client");
        assert_eq!(reply.status.as_deref(), Some("200"));
        assert_eq!(reply.payload, serde_json::json!({"sku": "A1"}));
        assert_eq!(reply.correlation_id, Some(env.message().id));
    }

    #[tokio::test]
    async fn test_execute_without_route_drops_reply() {
        let registry = CommandRegistry::new();
        registry.register(header(), |_| async { Ok(Some(Value::Bool(true))) });

        let env = Envelope::from_message(ServiceMessage::new(header(), Value::Null));
        let mut responses = Vec::new();
        assert!(registry.execute(&env, &mut responses).await.unwrap());
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_header_is_unhandled() {
        let registry = CommandRegistry::new();
        let env = Envelope::from_message(ServiceMessage::new(header(), Value::Null));
        let mut responses = Vec::new();
        assert!(!registry.execute(&env, &mut responses).await.unwrap());
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_handler_kind() {
        let registry = CommandRegistry::new();
        registry.register(header(), |_| async { Err(anyhow::anyhow!("db unavailable")) });

        let env = Envelope::from_message(ServiceMessage::new(header(), Value::Null));
        let err = registry.execute(&env, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), "handler");
        assert!(err.to_string().contains("db unavailable"));
    }
}

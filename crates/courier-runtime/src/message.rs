//! Service messages: the value an envelope carries through the dispatcher.

use chrono::{DateTime, Utc};
use courier_core::Lane;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel / message type / action triple a handler is registered under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHeader {
    pub channel_id: String,
    pub message_type: String,
    pub action_type: String,
}

impl MessageHeader {
    pub fn new(channel_id: &str, message_type: &str, action_type: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            message_type: message_type.to_string(),
            action_type: action_type.to_string(),
        }
    }

    /// A header is routable once it names a channel.
    pub fn is_routable(&self) -> bool {
        !self.channel_id.trim().is_empty()
    }

    /// Lookup key, `channel/type/action`, lowercased.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.channel_id, self.message_type, self.action_type).to_lowercase()
    }
}

impl std::fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.channel_id, self.message_type, self.action_type)
    }
}

/// An inbound or outbound service message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub id: Uuid,
    /// Where this message is going.
    pub header: MessageHeader,
    /// Where replies to this message should go. Empty channel = no reply route.
    #[serde(default)]
    pub response: MessageHeader,
    /// Id of the message this one answers.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Status code, e.g. "200" or "501".
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_description: Option<String>,
    #[serde(default)]
    pub priority: Lane,
    /// Dispatcher passes so far. Carried into responses so loops stay bounded.
    #[serde(default)]
    pub transit_count: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ServiceMessage {
    pub fn new(header: MessageHeader, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            header,
            response: MessageHeader::default(),
            correlation_id: None,
            status: None,
            status_description: None,
            priority: Lane::Normal,
            transit_count: 0,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Set the reply route.
    pub fn with_response(mut self, response: MessageHeader) -> Self {
        self.response = response;
        self
    }

    pub fn with_priority(mut self, priority: Lane) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: &str, description: &str) -> Self {
        self.status = Some(status.to_string());
        self.status_description = Some(description.to_string());
        self
    }

    pub fn has_response_route(&self) -> bool {
        self.response.is_routable()
    }

    /// Build the reply: the response-* fields become the header, the reply
    /// route is cleared and the reply correlates back to this message.
    pub fn to_response(&self) -> ServiceMessage {
        ServiceMessage {
            id: Uuid::new_v4(),
            header: self.response.clone(),
            response: MessageHeader::default(),
            correlation_id: Some(self.id),
            status: None,
            status_description: None,
            priority: self.priority,
            transit_count: self.transit_count,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_key_is_case_insensitive() {
        let a = MessageHeader::new("Orders", "Create", "Submit");
        let b = MessageHeader::new("orders", "create", "submit");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.to_string(), "Orders/Create/Submit");
    }

    #[test]
    fn test_blank_channel_not_routable() {
        assert!(!MessageHeader::default().is_routable());
        assert!(!MessageHeader::new("  ", "a", "b").is_routable());
    }

    #[test]
    fn test_to_response_swaps_route() {
        let mut msg = ServiceMessage::new(MessageHeader::new("in", "order", "create"), serde_json::json!({"n": 1}))
            .with_response(MessageHeader::new("out", "order", "created"))
            .with_priority(Lane::High);
        msg.transit_count = 3;

        let reply = msg.to_response();
        assert_eq!(reply.header, MessageHeader::new("out", "order", "created"));
        assert!(!reply.has_response_route());
        assert_eq!(reply.correlation_id, Some(msg.id));
        assert_eq!(reply.priority, Lane::High);
        assert_eq!(reply.transit_count, 3);
        assert_ne!(reply.id, msg.id);
    }

    #[test]
    fn test_serde_defaults() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "header": {"channel_id": "c", "message_type": "m", "action_type": "a"},
            "created_at": Utc::now(),
        });
        let msg: ServiceMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.priority, Lane::Normal);
        assert_eq!(msg.transit_count, 0);
        assert!(!msg.has_response_route());
    }
}

//! Channel transmitter: outbound delivery into in-process mpsc queues.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use courier_core::{CourierError, Result};
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::message::ServiceMessage;
use crate::traits::Transmitter;

/// [`Transmitter`] keyed by channel id (case-insensitive).
#[derive(Default)]
pub struct ChannelTransmitter {
    channels: RwLock<HashMap<String, mpsc::Sender<ServiceMessage>>>,
}

impl ChannelTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bounded channel and return its receiving end.
    pub fn open(&self, channel_id: &str, buffer: usize) -> mpsc::Receiver<ServiceMessage> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.register(channel_id, tx);
        rx
    }

    pub fn register(&self, channel_id: &str, sender: mpsc::Sender<ServiceMessage>) {
        tracing::debug!("📡 Outbound channel registered: {channel_id}");
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id.to_lowercase(), sender);
    }

    pub fn remove(&self, channel_id: &str) -> bool {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel_id.to_lowercase())
            .is_some()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Transmitter for ChannelTransmitter {
    async fn send(&self, envelope: &Envelope) -> Result<bool> {
        let channel_id = &envelope.message().header.channel_id;
        let sender = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel_id.to_lowercase())
            .cloned();
        let Some(sender) = sender else {
            return Ok(false);
        };

        sender
            .send(envelope.message().clone())
            .await
            .map_err(|_| CourierError::Transmit(format!("channel '{channel_id}' is closed")))?;
        tracing::debug!("📤 Sent {} to {channel_id}", envelope.id());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageHeader;

    fn envelope(channel: &str) -> Envelope {
        Envelope::from_message(ServiceMessage::new(
            MessageHeader::new(channel, "event", "notify"),
            serde_json::json!({"ok": true}),
        ))
    }

    #[tokio::test]
    async fn test_send_to_open_channel() {
        let transmitter = ChannelTransmitter::new();
        let mut rx = transmitter.open("Audit", 4);

        assert!(transmitter.send(&envelope("audit")).await.unwrap());
        let got = rx.recv().await.unwrap();
        assert_eq!(got.payload, serde_json::json!({"ok": true}));
        assert_eq!(transmitter.channel_ids(), vec!["audit"]);
    }

    #[tokio::test]
    async fn test_unknown_channel_reports_false() {
        let transmitter = ChannelTransmitter::new();
        assert!(!transmitter.send(&envelope("nowhere")).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_channel_is_transmit_error() {
        let transmitter = ChannelTransmitter::new();
        drop(transmitter.open("audit", 1));

        let err = transmitter.send(&envelope("audit")).await.unwrap_err();
        assert_eq!(err.kind(), "transmit");

        assert!(transmitter.remove("audit"));
        assert!(!transmitter.send(&envelope("audit")).await.unwrap());
    }
}

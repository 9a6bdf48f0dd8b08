//! Message and event types for the YoctoClaw message bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An incoming message from a channel (e.g., Telegram, Discord, WhatsApp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// The channel this message came from (e.g., "telegram", "whatsapp")
    pub channel: String,
    /// Unique identifier of the sender
    pub sender_id: String,
    /// Unique identifier of the chat/conversation
    pub chat_id: String,
    /// The text content of the message
    pub content: String,
    /// References to media attachments (file paths or URLs)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    /// Session key for routing (format: "channel:chat_id")
    pub session_key: String,
    /// Additional metadata key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// An outgoing message to be delivered via a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// The channel to send this message through
    pub channel: String,
    /// The chat/conversation to send to
    pub chat_id: String,
    /// The text content to send
    pub content: String,
}

/// An observer-only event carrying channel breadcrumbs that never enter the
/// main queues: connectivity changes, QR authentication codes, log lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxiliaryEvent {
    /// Originating channel (e.g. "whatsapp")
    pub channel: String,
    /// Event name (e.g. "qr_code", "connected", "timeout")
    pub event: String,
    /// Optional event payload (e.g. the raw QR data string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A bus event as seen by observers (dashboard streams and similar taps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    #[serde(flatten)]
    pub payload: BusEventPayload,
    /// When the event was published.
    pub at: DateTime<Utc>,
}

/// The payload of an observed bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEventPayload {
    Inbound { inbound: InboundMessage },
    Outbound { outbound: OutboundMessage },
    Auxiliary { auxiliary: AuxiliaryEvent },
}

impl BusEvent {
    pub(crate) fn inbound(msg: InboundMessage) -> Self {
        Self {
            payload: BusEventPayload::Inbound { inbound: msg },
            at: Utc::now(),
        }
    }

    pub(crate) fn outbound(msg: OutboundMessage) -> Self {
        Self {
            payload: BusEventPayload::Outbound { outbound: msg },
            at: Utc::now(),
        }
    }

    pub(crate) fn auxiliary(event: AuxiliaryEvent) -> Self {
        Self {
            payload: BusEventPayload::Auxiliary { auxiliary: event },
            at: Utc::now(),
        }
    }
}

impl InboundMessage {
    /// Create a new inbound message. The session key is derived as
    /// `"{channel}:{chat_id}"`.
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            session_key: format!("{}:{}", channel, chat_id),
            metadata: HashMap::new(),
        }
    }

    /// Attach a media reference (builder pattern).
    pub fn with_media(mut self, media_ref: &str) -> Self {
        self.media.push(media_ref.to_string());
        self
    }

    /// Add a metadata key-value pair (builder pattern).
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        }
    }

    /// Create an outbound message addressed back at an inbound message.
    pub fn reply_to(msg: &InboundMessage, content: &str) -> Self {
        Self::new(&msg.channel, &msg.chat_id, content)
    }
}

impl AuxiliaryEvent {
    /// Create a new auxiliary event.
    pub fn new(channel: &str, event: &str) -> Self {
        Self {
            channel: channel.to_string(),
            event: event.to_string(),
            detail: None,
        }
    }

    /// Attach a payload string (builder pattern).
    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_creation() {
        let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello");
        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.sender_id, "user123");
        assert_eq!(msg.chat_id, "chat456");
        assert_eq!(msg.content, "Hello");
        assert_eq!(msg.session_key, "telegram:chat456");
        assert!(msg.media.is_empty());
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_inbound_message_with_media_and_metadata() {
        let msg = InboundMessage::new("discord", "u1", "c1", "Check this")
            .with_media("/tmp/photo.png")
            .with_metadata("message_id", "12345");
        assert_eq!(msg.media, vec!["/tmp/photo.png"]);
        assert_eq!(msg.metadata.get("message_id"), Some(&"12345".to_string()));
    }

    #[test]
    fn test_outbound_reply_to_inbound() {
        let inbound = InboundMessage::new("telegram", "user123", "chat456", "Hello");
        let response = OutboundMessage::reply_to(&inbound, "Hello back!");
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "chat456");
        assert_eq!(response.content, "Hello back!");
    }

    #[test]
    fn test_message_serialization_roundtrip() {
        let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello")
            .with_metadata("key", "value");
        let json = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channel, "telegram");
        assert_eq!(back.session_key, "telegram:chat456");
        assert_eq!(back.metadata.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_bus_event_tagging() {
        let event = BusEvent::inbound(InboundMessage::new("cli", "u", "c", "hi"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"inbound""#));

        let event = BusEvent::auxiliary(
            AuxiliaryEvent::new("whatsapp", "qr_code").with_detail("otp://raw-code"),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"auxiliary""#));
        assert!(json.contains("qr_code"));
    }

    #[test]
    fn test_empty_media_not_serialized() {
        let msg = InboundMessage::new("cli", "u", "c", "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("media"));
        assert!(!json.contains("metadata"));
    }
}

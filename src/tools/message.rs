//! Message tool for proactive outbound messages.
//!
//! Lets the agent send a message through the bus outside the normal
//! reply path: to another chat, another channel, or mid-turn. The bus is
//! handed in as a capability; the tool holds no reference back into the
//! agent loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::{MessageBus, OutboundMessage};
use crate::error::{Result, YoctoError};

use super::{Tool, ToolContext};

/// Tool for sending outbound messages to channels.
pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    /// Create a new message tool publishing through `bus`.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to a chat. Omit channel and chat_id to message the \
         current conversation; set them to reach another one."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Message text to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Destination channel name. Defaults to the originating channel."
                },
                "chat_id": {
                    "type": "string",
                    "description": "Destination chat ID. Defaults to the originating chat."
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| YoctoError::Tool("Missing 'content' parameter".to_string()))?;

        let channel = args
            .get("channel")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ctx.channel.clone())
            .ok_or_else(|| YoctoError::Tool("No target channel available".to_string()))?;

        let chat_id = args
            .get("chat_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ctx.chat_id.clone())
            .ok_or_else(|| YoctoError::Tool("No target chat_id available".to_string()))?;

        self.bus
            .publish_outbound(OutboundMessage::new(&channel, &chat_id, content))
            .await?;

        Ok(format!("Message sent to {}:{}", channel, chat_id))
    }
}

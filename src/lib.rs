//! YoctoClaw - personal AI gateway
//!
//! Connects messaging channels to an LLM agent through an in-process
//! message bus, per-session history with rolling summaries, per-contact
//! policy, and MCP tool-server subprocesses.

pub mod agent;
pub mod bus;
pub mod config;
pub mod contacts;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod providers;
pub mod session;
pub mod tools;

pub use agent::{AgentLoop, AgentManager, ContextBuilder};
pub use bus::{AuxiliaryEvent, InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use contacts::{ContactPolicy, ContactStore};
pub use error::{Result, YoctoError};
pub use providers::{
    ChatOptions, LLMProvider, LLMResponse, LLMToolCall, OpenAiProvider, ToolDefinition, Usage,
};
pub use session::{Message, Role, Session, SessionStore, ToolCall};

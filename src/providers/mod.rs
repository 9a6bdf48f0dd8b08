//! Providers module - LLM provider trait and adapters
//!
//! The [`LLMProvider`] trait is the single capability the core consumes:
//! `(messages, tools, model, options) -> response`. Adapter-specific
//! concerns (wire dialects, string-encoded tool arguments) stay inside
//! the adapter implementations.

pub mod openai;
mod types;

pub use openai::OpenAiProvider;
pub use types::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage};

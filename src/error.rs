//! Error types for YoctoClaw
//!
//! This module defines all error types used throughout the gateway.
//! Uses `thiserror` for ergonomic error handling with automatic `Display`
//! and `Error` trait implementations.

use thiserror::Error;

/// The primary error type for YoctoClaw operations.
#[derive(Error, Debug)]
pub enum YoctoError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider errors (API failures, rate limits, model errors, etc.)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Channel errors (connection failures, message routing issues, etc.)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Tool execution errors (invalid parameters, execution failures, etc.)
    #[error("Tool error: {0}")]
    Tool(String),

    /// Session management errors (invalid state, persistence failures, etc.)
    #[error("Session error: {0}")]
    Session(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Message bus closed
    #[error("Bus error: queue closed")]
    BusClosed,

    /// Resource not found (sessions, tools, providers, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// MCP (Model Context Protocol) errors (server communication, tool execution, etc.)
    #[error("MCP error: {0}")]
    Mcp(String),

    /// Operation aborted by a cancellation token
    #[error("Cancelled")]
    Cancelled,
}

/// A specialized `Result` type for YoctoClaw operations.
pub type Result<T> = std::result::Result<T, YoctoError>;

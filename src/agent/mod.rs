//! Agent module - the per-profile agent loop and routing
//!
//! - [`AgentLoop`]: one per agent profile; turns an inbound message into an
//!   LLM tool-calling iteration backed by session history, contact policy,
//!   and MCP tools.
//! - [`AgentManager`]: consumes the bus and routes each message to the
//!   loop its contact policy names.
//! - [`ContextBuilder`]: assembles the ordered message list for one call.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  MessageBus │────>│ AgentManager │────>│  AgentLoop  │
//! │  (inbound)  │     │  (routing)   │     │ (per agent) │
//! └─────────────┘     └──────────────┘     └──────┬──────┘
//!                                                 │
//!                        ┌────────────┬───────────┼───────────┐
//!                        ▼            ▼           ▼           ▼
//!                   SessionStore  ContactStore  Tools    LLMProvider
//!                                              (+ MCP)
//! ```

mod context;
mod r#loop;
mod manager;

pub use context::ContextBuilder;
pub use manager::AgentManager;
pub use r#loop::{AgentLoop, MCP_REFUSAL};

//! Agent runtime for the Vega execution engine.
//!
//! This crate binds agent processes to their static configuration and
//! turns agent communication into data the scheduler can suspend and
//! resume around:
//! - [`AgentState`] - append-only conversation history + pending request
//! - [`build_request`] / [`parse_reply`] - the backend protocol
//! - [`LlmTransport`] - the asynchronous HTTP collaborator contract
//! - [`CompletionQueue`] - the one thread-safe boundary in the engine
//! - [`StubTransport`] - scriptable transport for tests and offline use
//!
//! # Examples
//!
//! ```
//! use agent_runtime::{AgentState, Role};
//!
//! let mut state = AgentState::new(0);
//! state.push_user("ping");
//! state.push_assistant("pong");
//! assert_eq!(state.history.len(), 2);
//! assert_eq!(state.history[0].role, Role::User);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod agent;
pub mod completion;
pub mod transport;

// Re-export main types at crate root
pub use agent::{build_request, parse_reply, AgentState, ChatEntry, Reply, Role, ToolCall};
pub use completion::{CompletionQueue, CompletionSender};
pub use transport::{
    Completion, LlmRequest, LlmResponse, LlmTransport, RequestHandle, StubTransport,
    TransportError,
};

//! Agent conversation state, request assembly, and response parsing.
//!
//! An agent process owns one `AgentState`: the immutable configuration it
//! was spawned from lives in the loaded agent table; the append-only
//! conversation history and the pending-request key live here.

use crate::transport::{LlmRequest, LlmResponse, RequestHandle};
use bytecode_system::AgentDef;
use core_types::ErrorKind;
use serde::{Deserialize, Serialize};

/// Author of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message sent into the agent
    User,
    /// Backend reply (text or tool request)
    Assistant,
    /// Result of an executed tool function
    Tool,
}

/// A backend request to execute a declared tool function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool (function) name
    pub name: String,
    /// Positional arguments as a JSON array
    pub arguments: serde_json::Value,
}

/// One entry of an agent's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Who authored this entry
    pub role: Role,
    /// Entry text (empty for pure tool-request entries)
    pub content: String,
    /// Tool request attached to an assistant entry, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

/// Mutable per-agent state, owned by the agent process.
///
/// History only grows while the process is alive; there is deliberately
/// no removal API. `pending` holds the in-flight request handle while the
/// process is suspended on the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    /// Index of the bound definition in the loaded agent table
    pub def: usize,
    /// Append-only ordered conversation history
    pub history: Vec<ChatEntry>,
    /// In-flight request handle while suspended
    pub pending: Option<RequestHandle>,
}

impl AgentState {
    /// Creates state for a freshly spawned agent with empty history.
    pub fn new(def: usize) -> Self {
        Self {
            def,
            history: Vec::new(),
            pending: None,
        }
    }

    /// Appends a user message.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.history.push(ChatEntry {
            role: Role::User,
            content: content.into(),
            tool_call: None,
        });
    }

    /// Appends an assistant text reply.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.history.push(ChatEntry {
            role: Role::Assistant,
            content: content.into(),
            tool_call: None,
        });
    }

    /// Appends an assistant tool request.
    pub fn push_tool_request(&mut self, call: ToolCall) {
        self.history.push(ChatEntry {
            role: Role::Assistant,
            content: String::new(),
            tool_call: Some(call),
        });
    }

    /// Appends the result of an executed tool.
    pub fn push_tool_result(&mut self, content: impl Into<String>) {
        self.history.push(ChatEntry {
            role: Role::Tool,
            content: content.into(),
            tool_call: None,
        });
    }
}

/// Default backend endpoint; the embedder can override per request.
pub const DEFAULT_ENDPOINT: &str = "https://api.vega.dev/v1/chat";

/// Assembles a request from the agent's configuration, its full history,
/// and the names of its declared tools.
pub fn build_request(
    def: &AgentDef,
    history: &[ChatEntry],
    tool_names: &[String],
    auth: Option<String>,
) -> LlmRequest {
    LlmRequest {
        endpoint: DEFAULT_ENDPOINT.to_string(),
        auth,
        payload: serde_json::json!({
            "model": def.model,
            "system": def.system_prompt,
            "temperature": def.temperature,
            "messages": history,
            "tools": tool_names,
        }),
    }
}

/// A parsed backend reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Final text answer; ends the send cycle
    Text(String),
    /// Request to execute a declared tool before answering
    Tool(ToolCall),
}

/// Parses a raw response into a reply.
///
/// Non-success statuses and bodies with neither a `content` string nor a
/// `tool` object map to [`ErrorKind::Agent`], carrying the HTTP status.
pub fn parse_reply(response: &LlmResponse) -> Result<Reply, ErrorKind> {
    if !(200..300).contains(&response.status) {
        return Err(ErrorKind::Agent {
            status: Some(response.status),
            message: "backend returned non-success status".to_string(),
        });
    }
    if let Some(tool) = response.body.get("tool") {
        let call: ToolCall =
            serde_json::from_value(tool.clone()).map_err(|e| ErrorKind::Agent {
                status: Some(response.status),
                message: format!("malformed tool request: {e}"),
            })?;
        return Ok(Reply::Tool(call));
    }
    match response.body.get("content").and_then(|v| v.as_str()) {
        Some(content) => Ok(Reply::Text(content.to_string())),
        None => Err(ErrorKind::Agent {
            status: Some(response.status),
            message: "response body has neither content nor tool".to_string(),
        }),
    }
}

impl LlmResponse {
    /// A successful text reply, in the protocol's body shape.
    pub fn text(content: &str) -> Self {
        Self {
            status: 200,
            body: serde_json::json!({ "content": content }),
        }
    }

    /// A successful tool-request reply, in the protocol's body shape.
    pub fn tool(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: serde_json::json!({ "tool": { "name": name, "arguments": arguments } }),
        }
    }
}

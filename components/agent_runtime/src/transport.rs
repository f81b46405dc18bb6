//! LLM transport contract.
//!
//! The HTTP collaborator's internals are out of scope; only its contract
//! matters to the engine: `submit(request) -> handle` must not block, and
//! `poll()` yields every completion that arrived since the last poll.
//! The scheduler is the only caller of both.

use core_types::ErrorKind;
use thiserror::Error;

/// Opaque key identifying one submitted request.
///
/// Handles are unique per transport instance; the scheduler uses them as
/// pending-request record keys, so a duplicate completion for a handle
/// already resolved is detectable and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// One outgoing backend request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// Target endpoint URL
    pub endpoint: String,
    /// Authorization header value, if configured
    pub auth: Option<String>,
    /// JSON payload built from agent config and conversation history
    pub payload: serde_json::Value,
}

/// One backend response, before protocol-level parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: serde_json::Value,
}

/// A transport-level failure (the request never produced a response).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Connection-level failure
    #[error("network failure: {0}")]
    Network(String),
    /// No response within the transport's deadline
    #[error("request timed out")]
    Timeout,
}

impl From<TransportError> for ErrorKind {
    fn from(err: TransportError) -> Self {
        ErrorKind::Agent {
            status: None,
            message: err.to_string(),
        }
    }
}

/// A resolved request: the handle it was submitted under, and its result.
pub type Completion = (RequestHandle, Result<LlmResponse, TransportError>);

/// The asynchronous transport contract.
///
/// Implementations may run network I/O on their own threads, but they may
/// only hand results back through `poll` (typically via a
/// [`CompletionQueue`](crate::CompletionQueue)); they must never touch
/// process or value state directly. Every submitted request must
/// eventually complete, with a response or a [`TransportError`]; the
/// scheduler polls for as long as a request is in flight.
pub trait LlmTransport {
    /// Submits a request without blocking and returns its handle.
    fn submit(&mut self, request: LlmRequest) -> RequestHandle;

    /// Returns all completions that arrived since the last poll, in
    /// arrival order. Must not block.
    fn poll(&mut self) -> Vec<Completion>;
}

/// Scriptable in-process transport for tests and offline embedding.
///
/// Submissions are recorded; completions are produced either by an
/// auto-reply function or by explicit [`resolve`](StubTransport::resolve)
/// calls, which may arrive in any order and may deliberately duplicate a
/// handle to exercise the scheduler's discard rules.
///
/// # Examples
///
/// ```
/// use agent_runtime::{LlmRequest, LlmResponse, LlmTransport, StubTransport};
///
/// let mut transport = StubTransport::new();
/// let handle = transport.submit(LlmRequest {
///     endpoint: "stub".to_string(),
///     auth: None,
///     payload: serde_json::json!({}),
/// });
/// transport.resolve(handle, Ok(LlmResponse::text("pong")));
/// assert_eq!(transport.poll().len(), 1);
/// ```
#[derive(Default)]
pub struct StubTransport {
    next_handle: u64,
    submitted: Vec<(RequestHandle, LlmRequest)>,
    queued: Vec<Completion>,
    #[allow(clippy::type_complexity)]
    auto: Option<Box<dyn FnMut(&LlmRequest) -> Result<LlmResponse, TransportError>>>,
}

impl std::fmt::Debug for StubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubTransport")
            .field("submitted", &self.submitted.len())
            .field("queued", &self.queued.len())
            .field("auto", &self.auto.is_some())
            .finish()
    }
}

impl StubTransport {
    /// Creates a transport that only resolves on explicit `resolve` calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that resolves every submission on the next
    /// poll using `reply`.
    pub fn auto(
        reply: impl FnMut(&LlmRequest) -> Result<LlmResponse, TransportError> + 'static,
    ) -> Self {
        Self {
            auto: Some(Box::new(reply)),
            ..Self::default()
        }
    }

    /// Creates a transport that answers every request with the same text.
    pub fn always_text(text: &str) -> Self {
        let text = text.to_string();
        Self::auto(move |_| Ok(LlmResponse::text(&text)))
    }

    /// All submissions so far, in submission order.
    pub fn submitted(&self) -> &[(RequestHandle, LlmRequest)] {
        &self.submitted
    }

    /// Queues a completion for the next poll. Duplicate handles are
    /// queued as given; discarding them is the scheduler's job.
    pub fn resolve(&mut self, handle: RequestHandle, result: Result<LlmResponse, TransportError>) {
        self.queued.push((handle, result));
    }
}

impl LlmTransport for StubTransport {
    fn submit(&mut self, request: LlmRequest) -> RequestHandle {
        let handle = RequestHandle(self.next_handle);
        self.next_handle += 1;
        if let Some(reply) = self.auto.as_mut() {
            self.queued.push((handle, reply(&request)));
        }
        self.submitted.push((handle, request));
        handle
    }

    fn poll(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.queued)
    }
}

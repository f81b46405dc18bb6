//! Runtime error types.
//!
//! Vega distinguishes three error tiers: artifact load errors (fatal at
//! startup, defined in `bytecode_system`), per-process runtime errors
//! (defined here; fatal only to the issuing process), and collaborator
//! failures, which the agent runtime maps into the same `RuntimeError`
//! shape so call sites see a uniform failure regardless of cause.

use crate::ProcessId;
use thiserror::Error;

/// The category of a per-process runtime fault.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// Operand types do not fit the operation (e.g. `string + int`)
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// Integer or float division by zero
    #[error("division by zero")]
    DivisionByZero,
    /// Call with the wrong number of arguments
    #[error("arity mismatch: {callee} expects {expected} arguments, got {got}")]
    ArityMismatch {
        /// Name of the called function or native capability
        callee: String,
        /// Declared arity
        expected: u8,
        /// Number of arguments supplied
        got: u8,
    },
    /// Array index or object field out of range
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),
    /// Instruction popped more operands than the stack held
    #[error("operand stack underflow")]
    StackUnderflow,
    /// Jump target outside the current function's code
    #[error("jump target {0} out of range")]
    InvalidJump(usize),
    /// Instruction cursor ran past the function's code without a return
    #[error("instruction cursor out of range")]
    InvalidCursor,
    /// `call-native` addressed an unregistered capability id
    #[error("unknown native capability {0}")]
    UnknownNative(u16),
    /// Call target is not in the function table
    #[error("unknown function {0}")]
    UnknownFunction(String),
    /// Agent handle does not name a live agent process
    #[error("unknown agent {0}")]
    UnknownAgent(ProcessId),
    /// Agent-specific fault: transport failure, bad status, malformed
    /// response, or undeclared tool
    #[error("agent error{}: {message}", match .status { Some(s) => format!(" (http {s})"), None => String::new() })]
    Agent {
        /// HTTP status, where the failure carried one
        status: Option<u16>,
        /// Description of the fault
        message: String,
    },
    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

/// A fault that terminates a single process.
///
/// Every `Failed` process transition carries one of these; it always
/// records the owning process, the offset of the faulting instruction in
/// the loaded code segment, and the fault category.
///
/// # Examples
///
/// ```
/// use core_types::{ErrorKind, ProcessId, RuntimeError};
///
/// let err = RuntimeError {
///     pid: ProcessId(3),
///     offset: 17,
///     kind: ErrorKind::DivisionByZero,
/// };
/// assert_eq!(err.to_string(), "process #3 at offset 17: division by zero");
/// ```
#[derive(Debug, Clone, PartialEq, Error)]
#[error("process {pid} at offset {offset}: {kind}")]
pub struct RuntimeError {
    /// The process the fault terminated
    pub pid: ProcessId,
    /// Offset of the faulting instruction in the code segment
    pub offset: usize,
    /// Fault category
    pub kind: ErrorKind,
}

//! Core Vega value types and error handling.
//!
//! This crate provides the foundational types for the Vega execution
//! engine: runtime value representation, process identifiers, the
//! per-process error shape, and the trace event stream.
//!
//! # Overview
//!
//! - [`Value`] - Tagged representation of Vega runtime values
//! - [`ProcessId`] - Identifier of a lightweight process
//! - [`RuntimeError`] - Per-process fault with process id, offset, and kind
//! - [`ErrorKind`] - Categories of runtime faults
//! - [`TraceEvent`] / [`TraceSink`] - Optional observability stream
//!
//! # Examples
//!
//! ```
//! use core_types::{ErrorKind, ProcessId, RuntimeError, Value};
//!
//! let v = Value::Int(42);
//! assert_eq!(v.type_name(), "int");
//!
//! let err = RuntimeError {
//!     pid: ProcessId(1),
//!     offset: 0,
//!     kind: ErrorKind::DivisionByZero,
//! };
//! assert!(err.to_string().contains("division by zero"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod trace;
mod value;

pub use error::{ErrorKind, RuntimeError};
pub use trace::{RecordingSink, TraceEvent, TraceSink};
pub use value::{HeapId, ProcessId, Value};

//! Memory Manager - reference-counted heap for Vega values
//!
//! This component provides:
//! - Slot-arena storage for strings, arrays, and objects
//! - Explicit retain/release reference counting (zero frees recursively)
//! - Deep structural equality, truthiness, and stringification
//! - Allocating string operations (concat, substr, split)
//!
//! The heap is owned by one VM instance and touched only from the
//! scheduler's execution context; it carries no internal synchronization.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod heap;

// Re-export main types
pub use heap::{Heap, HeapValue};

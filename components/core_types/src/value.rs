//! Vega value representation using tagged variants.
//!
//! This module provides the core `Value` enum that represents all possible
//! Vega runtime values. Scalars are stored inline; strings, arrays, and
//! objects live on the reference-counted heap and are referenced by slot id.

use std::fmt;

/// Identifier of a heap slot in the memory manager.
///
/// A `HeapId` is only meaningful together with the heap that issued it.
/// The heap guarantees an id is never reused while any `Value` still
/// holds a contributing reference count.
pub type HeapId = usize;

/// Identifier of a lightweight process.
///
/// Process ids are allocated by the VM and never reused within a VM
/// instance, so a stale id can always be detected against the process
/// table (the dangling-completion rule depends on this).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Represents any Vega runtime value.
///
/// This enum uses a tagged representation. Scalar values are stored
/// inline, while heap-allocated payloads (strings, arrays, objects) are
/// referenced by `HeapId` and carry a reference count in the heap slot.
///
/// Copying a heap-referencing `Value` into another live location must go
/// through `Heap::retain`; dropping one goes through `Heap::release`.
/// `Clone` alone does not adjust reference counts.
///
/// # Examples
///
/// ```
/// use core_types::Value;
///
/// let n = Value::Int(42);
/// assert_eq!(n.type_name(), "int");
/// assert!(n.heap_id().is_none());
///
/// let s = Value::Str(0);
/// assert_eq!(s.heap_id(), Some(0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value
    Null,
    /// Boolean (true or false)
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// IEEE 754 double-precision floating point
    Float(f64),
    /// Heap-allocated immutable string (referenced by slot id)
    Str(HeapId),
    /// Heap-allocated array (referenced by slot id)
    Array(HeapId),
    /// Heap-allocated object (referenced by slot id)
    Object(HeapId),
    /// Reference to a function in the loaded function table
    Function(usize),
    /// Handle to a spawned agent process
    Agent(ProcessId),
}

impl Value {
    /// Returns the heap slot id if this value references heap storage.
    ///
    /// Scalars, function references, and agent handles return `None`.
    pub fn heap_id(&self) -> Option<HeapId> {
        match self {
            Value::Str(id) | Value::Array(id) | Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the name of this value's type, as surfaced in diagnostics.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_types::Value;
    ///
    /// assert_eq!(Value::Null.type_name(), "null");
    /// assert_eq!(Value::Float(3.5).type_name(), "float");
    /// assert_eq!(Value::Function(0).type_name(), "function");
    /// ```
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Agent(_) => "agent",
        }
    }

    /// Scalar truthiness, for values that carry no heap payload.
    ///
    /// Heap-referencing values need the heap to decide (an empty string is
    /// falsy), so the full rule lives on `Heap::truthy`. For scalars:
    /// null and false are falsy, numbers are falsy when zero (or NaN),
    /// function references and agent handles are always truthy.
    pub fn scalar_truthy(&self) -> Option<bool> {
        match self {
            Value::Null => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Int(n) => Some(*n != 0),
            Value::Float(n) => Some(!n.is_nan() && *n != 0.0),
            Value::Function(_) | Value::Agent(_) => Some(true),
            Value::Str(_) | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

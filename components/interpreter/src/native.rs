//! Native capability registry.
//!
//! Native capabilities are host functions addressed by the `call-native`
//! instruction. The registry starts empty; the embedder decides what the
//! program may touch. Registration after processes have started is
//! allowed, since ids are only resolved at call time.

use core_types::{ErrorKind, Value};
use memory_manager::Heap;
use std::collections::HashMap;

/// A host function callable from bytecode.
///
/// Arguments are borrowed; the returned value's ownership transfers to
/// the caller's operand stack. Errors terminate the calling process.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, ErrorKind>;

/// One registered capability.
#[derive(Clone)]
pub struct NativeCapability {
    /// Name used in arity diagnostics
    pub name: String,
    /// Declared argument count
    pub arity: u8,
    /// The host function
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCapability")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Capability table keyed by the ids `call-native` carries.
///
/// # Examples
///
/// ```
/// use interpreter::NativeRegistry;
/// use core_types::Value;
///
/// let mut natives = NativeRegistry::new();
/// natives.register(0, "len", 1, |heap, args| {
///     heap.array_len(&args[0]).map(|n| Value::Int(n as i64))
/// });
/// assert!(natives.get(0).is_some());
/// assert!(natives.get(1).is_none());
/// ```
#[derive(Debug, Default)]
pub struct NativeRegistry {
    entries: HashMap<u16, NativeCapability>,
}

impl NativeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func` under `id`, replacing any previous entry.
    pub fn register(&mut self, id: u16, name: &str, arity: u8, func: NativeFn) {
        self.entries.insert(
            id,
            NativeCapability {
                name: name.to_string(),
                arity,
                func,
            },
        );
    }

    /// Looks up a capability by id.
    pub fn get(&self, id: u16) -> Option<&NativeCapability> {
        self.entries.get(&id)
    }
}

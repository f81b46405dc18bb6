//! Integration test suite for the Vega execution engine
//!
//! This crate provides integration tests that verify components work
//! together correctly across component boundaries.

/// Re-export components for test convenience
pub mod components {
    pub use agent_runtime;
    pub use bytecode_system;
    pub use core_types;
    pub use interpreter;
    pub use memory_manager;
}

//! Bytecode system for the Vega execution engine
//!
//! This crate defines the instruction set, the loaded program tables
//! (constant pool, code segment, function table, agent table), and the
//! binary artifact format the compiler collaborator produces.
//!
//! # Features
//!
//! - Stack-based instruction set with agent primitives
//! - `ProgramBuilder` for assembling multi-function programs
//! - Binary artifact serialization with strict section bounds checking
//!
//! # Example
//!
//! ```
//! use bytecode_system::{artifact, Const, Opcode, ProgramBuilder};
//!
//! let mut b = ProgramBuilder::new();
//! let c = b.add_constant(Const::Int(42));
//! b.begin_function("main", 0, 0);
//! b.emit(Opcode::PushConst(c));
//! b.emit(Opcode::Return);
//! b.finish_function();
//! let program = b.finish();
//!
//! let bytes = artifact::to_bytes(&program);
//! assert_eq!(artifact::load(&bytes).unwrap(), program);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod artifact;
pub mod opcode;
pub mod program;

// Re-export main types at crate root
pub use artifact::LoadError;
pub use opcode::Opcode;
pub use program::{AgentDef, Const, FunctionDef, Program, ProgramBuilder};

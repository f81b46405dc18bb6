//! Bytecode interpreter and process scheduler for the Vega engine.
//!
//! This crate ties the other components together:
//! - [`dispatch`] - single-instruction execution over one process
//! - [`process`] - call frames and per-process state
//! - [`scheduler`] - cooperative FIFO scheduling with a fairness quota
//! - [`native`] - host capability registry for `call-native`
//! - [`vm`] - the [`Vm`] orchestrating processes, agents, and transport
//!
//! # Example
//!
//! ```
//! use agent_runtime::StubTransport;
//! use bytecode_system::{Const, Opcode, ProgramBuilder};
//! use core_types::Value;
//! use interpreter::{ExitStatus, Vm};
//!
//! let mut b = ProgramBuilder::new();
//! let greeting = b.add_constant(Const::Str("hello".to_string()));
//! b.begin_function("main", 0, 0);
//! b.emit(Opcode::PushConst(greeting));
//! b.emit(Opcode::Return);
//! b.finish_function();
//!
//! let mut vm = Vm::new(b.finish(), Box::new(StubTransport::new()));
//! let pid = vm.run("main", vec![]).unwrap();
//! match vm.exit_status(pid) {
//!     Some(ExitStatus::Done(v)) => assert_eq!(vm.display(v), "hello"),
//!     other => panic!("unexpected exit {other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod dispatch;
pub mod native;
pub mod process;
pub mod scheduler;
pub mod vm;

// Re-export main types at crate root
pub use dispatch::{step, StepOutcome};
pub use native::{NativeCapability, NativeFn, NativeRegistry};
pub use process::{Frame, Process, ProcessState};
pub use scheduler::{Scheduler, WaitReason, DEFAULT_QUOTA};
pub use vm::{ExitStatus, FrameInfo, PendingRequest, ProcessInfo, Vm};

//! Loaded program tables and the program builder.
//!
//! A `Program` holds the shared, immutable tables every process executes
//! against: the constant pool, the flat code segment, the function table,
//! and the agent table. `ProgramBuilder` is the surface the compiler
//! collaborator (and the test suite) uses to assemble one.

use crate::opcode::Opcode;

/// A literal in the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    /// The null value
    Null,
    /// Boolean literal
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// String literal
    Str(String),
}

/// A function table entry. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Function name (used for entry-point and tool lookup)
    pub name: String,
    /// Number of declared parameters
    pub arity: u8,
    /// Number of local slots, parameters included
    pub locals: u16,
    /// Offset of the first instruction in the code segment
    pub code_offset: usize,
    /// Number of instructions belonging to this function
    pub code_len: usize,
}

/// An agent table entry: the static configuration an agent process is
/// bound to. Immutable after load and shareable by many processes.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDef {
    /// Agent name (used by `spawn-agent` diagnostics)
    pub name: String,
    /// Backend model identifier
    pub model: String,
    /// System prompt sent with every request
    pub system_prompt: String,
    /// Sampling temperature sent with every request
    pub temperature: f64,
    /// Function table indices of the tools this agent may call
    pub tools: Vec<u16>,
}

/// The loaded, immutable program.
///
/// # Examples
///
/// ```
/// use bytecode_system::{Const, Opcode, ProgramBuilder};
///
/// let mut b = ProgramBuilder::new();
/// let c = b.add_constant(Const::Int(5));
/// b.begin_function("main", 0, 0);
/// b.emit(Opcode::PushConst(c));
/// b.emit(Opcode::Return);
/// b.finish_function();
///
/// let program = b.finish();
/// assert_eq!(program.function_named("main"), Some(0));
/// assert_eq!(program.code.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    /// Constant pool
    pub constants: Vec<Const>,
    /// Flat code segment; functions address ranges within it
    pub code: Vec<Opcode>,
    /// Function table
    pub functions: Vec<FunctionDef>,
    /// Agent table
    pub agents: Vec<AgentDef>,
}

impl Program {
    /// Looks up a function table index by name.
    pub fn function_named(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Looks up an agent table index by name.
    pub fn agent_named(&self, name: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.name == name)
    }
}

/// Incremental builder for a `Program`.
///
/// Instructions are emitted into the currently open function;
/// `begin_function` records the code offset and `finish_function` seals
/// the length.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    open: Option<usize>,
}

impl ProgramBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constant to the pool and returns its index.
    pub fn add_constant(&mut self, value: Const) -> usize {
        let idx = self.program.constants.len();
        self.program.constants.push(value);
        idx
    }

    /// Opens a new function and returns its table index.
    ///
    /// # Panics
    ///
    /// Panics if another function is still open.
    pub fn begin_function(&mut self, name: &str, arity: u8, locals: u16) -> usize {
        assert!(self.open.is_none(), "previous function not finished");
        let idx = self.program.functions.len();
        self.program.functions.push(FunctionDef {
            name: name.to_string(),
            arity,
            locals,
            code_offset: self.program.code.len(),
            code_len: 0,
        });
        self.open = Some(idx);
        idx
    }

    /// Emits an instruction into the open function.
    ///
    /// # Panics
    ///
    /// Panics if no function is open.
    pub fn emit(&mut self, op: Opcode) {
        assert!(self.open.is_some(), "emit outside a function");
        self.program.code.push(op);
    }

    /// Offset the next emitted instruction will get, relative to the open
    /// function's start. Used to compute jump targets.
    pub fn next_offset(&self) -> usize {
        match self.open {
            Some(idx) => self.program.code.len() - self.program.functions[idx].code_offset,
            None => 0,
        }
    }

    /// Patches a previously emitted jump at function-relative `at` to
    /// target the next emitted instruction.
    ///
    /// # Panics
    ///
    /// Panics if `at` does not hold a jump instruction.
    pub fn patch_jump(&mut self, at: usize) {
        let idx = self.open.expect("patch outside a function");
        let base = self.program.functions[idx].code_offset;
        let target = self.program.code.len() - base;
        match &mut self.program.code[base + at] {
            Opcode::Jump(t) | Opcode::JumpIfTrue(t) | Opcode::JumpIfFalse(t) => *t = target,
            other => panic!("patch_jump at non-jump instruction {other:?}"),
        }
    }

    /// Seals the open function, fixing its code length.
    ///
    /// # Panics
    ///
    /// Panics if no function is open.
    pub fn finish_function(&mut self) {
        let idx = self.open.take().expect("no function open");
        let f = &mut self.program.functions[idx];
        f.code_len = self.program.code.len() - f.code_offset;
    }

    /// Adds an agent definition and returns its table index.
    pub fn add_agent(&mut self, def: AgentDef) -> usize {
        let idx = self.program.agents.len();
        self.program.agents.push(def);
        idx
    }

    /// Finishes the build.
    ///
    /// # Panics
    ///
    /// Panics if a function is still open.
    pub fn finish(self) -> Program {
        assert!(self.open.is_none(), "function left open");
        self.program
    }
}

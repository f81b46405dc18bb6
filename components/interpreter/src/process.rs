//! Lightweight process representation.
//!
//! A process is one cooperatively scheduled unit of bytecode execution:
//! a stack of call frames, an instruction cursor (the top frame's `pc`),
//! and optionally the agent state that binds it to an agent definition.
//! Agent processes spawned by `spawn-agent` start with no frames; they
//! hold conversation state and only execute bytecode when a tool call
//! runs on them.

use agent_runtime::AgentState;
use core_types::{ProcessId, Value};

/// Scheduling state of a process.
///
/// `Done` and `Failed` are terminal; a terminated process is reaped
/// after any required handoff, releasing every Value it held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, queued for a turn
    Ready,
    /// Currently executing (at most one process at a time)
    Running,
    /// Suspended on an external event
    Waiting,
    /// Top frame returned; terminal
    Done,
    /// Unhandled runtime error; terminal
    Failed,
}

/// One function activation: locals, operand-stack segment, and the
/// instruction cursor (absolute offset into the loaded code segment).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Function table index
    pub function: usize,
    /// Absolute offset of the next instruction in the code segment
    pub pc: usize,
    /// Local slots, sized from the function's declared count at call time
    pub locals: Vec<Value>,
    /// Operand-stack segment; grows and shrinks within this frame only
    pub stack: Vec<Value>,
}

impl Frame {
    /// Creates a frame for `function` starting at `pc`, with `slots`
    /// local slots of which the first `args.len()` are the arguments.
    pub fn new(function: usize, pc: usize, slots: u16, args: Vec<Value>) -> Self {
        let mut locals = args;
        locals.resize(usize::from(slots).max(locals.len()), Value::Null);
        Self {
            function,
            pc,
            locals,
            stack: Vec::new(),
        }
    }
}

/// A process's full execution context.
#[derive(Debug)]
pub struct Process {
    /// Process identifier, unique within the owning VM
    pub id: ProcessId,
    /// Scheduling state
    pub state: ProcessState,
    /// Call frames, innermost last
    pub frames: Vec<Frame>,
    /// Agent binding, present on processes created by `spawn-agent`
    pub agent: Option<AgentState>,
}

impl Process {
    /// Creates a bytecode process with one initial frame.
    pub fn new(id: ProcessId, frame: Frame) -> Self {
        Self {
            id,
            state: ProcessState::Ready,
            frames: vec![frame],
            agent: None,
        }
    }

    /// Creates a frameless agent process bound to `agent`.
    pub fn new_agent(id: ProcessId, agent: AgentState) -> Self {
        Self {
            id,
            state: ProcessState::Ready,
            frames: Vec::new(),
            agent: Some(agent),
        }
    }

    /// True if this process carries agent state.
    pub fn is_agent(&self) -> bool {
        self.agent.is_some()
    }

    /// Offset of the instruction the process will execute next, or the
    /// last reported offset for a frameless process.
    pub fn current_offset(&self) -> usize {
        self.frames.last().map(|f| f.pc).unwrap_or(0)
    }

    /// Pushes a value onto the top frame's operand stack.
    ///
    /// Returns false (value unconsumed) if the process has no frames;
    /// the caller must release the value in that case.
    pub fn push_value(&mut self, value: Value) -> Result<(), Value> {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.stack.push(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Drains every Value held by this process's frames, for release at
    /// reap time.
    pub fn drain_values(&mut self) -> Vec<Value> {
        let mut values = Vec::new();
        for mut frame in self.frames.drain(..) {
            values.append(&mut frame.locals);
            values.append(&mut frame.stack);
        }
        values
    }
}

//! Bytecode opcodes for the Vega execution engine
//!
//! Defines all instructions for the stack-based VM. Jump targets are
//! absolute offsets within the current function's code range, not within
//! the whole code segment.

/// Bytecode opcodes for Vega execution
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    // Literals
    /// Push constant from the constant pool at given index
    PushConst(usize),
    /// Push the null value
    PushNull,
    /// Push boolean true
    PushTrue,
    /// Push boolean false
    PushFalse,
    /// Push a reference to the function table entry at given index
    PushFunction(u16),

    // Stack management
    /// Discard the top of stack
    Pop,
    /// Duplicate the top of stack
    Dup,

    // Variables
    /// Push local slot at given index
    LoadLocal(u16),
    /// Pop into local slot at given index
    StoreLocal(u16),
    /// Push global slot at given index
    LoadGlobal(u16),
    /// Pop into global slot at given index
    StoreGlobal(u16),

    // Arithmetic operations
    /// Add top two stack values (Int + Float promotes to Float)
    Add,
    /// Subtract top from second-top
    Sub,
    /// Multiply top two stack values
    Mul,
    /// Divide second-top by top
    Div,
    /// Modulo second-top by top
    Mod,
    /// Negate top value
    Neg,

    // Logical operations
    /// Logical NOT (invert truthiness)
    Not,
    /// Logical AND of top two truthiness values
    And,
    /// Logical OR of top two truthiness values
    Or,

    // Comparison operations
    /// Structural equality
    Equal,
    /// Structural inequality
    NotEqual,
    /// Less than (numeric or string order)
    Less,
    /// Less than or equal
    LessEqual,
    /// Greater than
    Greater,
    /// Greater than or equal
    GreaterEqual,

    // Control flow
    /// Unconditional jump to function-relative offset
    Jump(usize),
    /// Jump if top of stack is truthy
    JumpIfTrue(usize),
    /// Jump if top of stack is falsy
    JumpIfFalse(usize),

    // Functions
    /// Call the function reference below the arguments, with given
    /// argument count
    Call(u8),
    /// Return from the current function (value on top of stack)
    Return,
    /// Call a native capability by id with given argument count
    CallNative(u16, u8),

    // Agents
    /// Spawn an agent process from the agent table entry at given index,
    /// pushing its handle
    SpawnAgent(u16),
    /// Pop a message and an agent handle, send, and suspend until the
    /// reply arrives
    AgentSend,

    // Containers
    /// Create an array from the top n stack values
    MakeArray(u16),
    /// Create an object from the top n key/value pairs (keys are strings)
    MakeObject(u16),
    /// Get value at computed index (array[int] or object[string])
    GetIndex,
    /// Set value at computed index
    SetIndex,
    /// Get object field named by the constant pool entry at given index
    GetField(usize),
    /// Set object field named by the constant pool entry at given index
    SetField(usize),

    // Debugging
    /// Pop and print the top of stack
    Print,
}

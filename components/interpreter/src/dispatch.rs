//! Single-instruction dispatch.
//!
//! `step` executes exactly one instruction of one process. The cursor is
//! advanced before the opcode runs, so jumps overwrite it and everything
//! else falls through to the next instruction. Anything that needs the
//! scheduler (spawning an agent, sending to one, terminating) is
//! reported as a [`StepOutcome`] rather than handled here; dispatch
//! never sees other processes.
//!
//! Every operand popped here is either pushed back, stored, handed off,
//! or released. Error paths release what they popped before returning,
//! so a faulting process leaks nothing beyond what reaping reclaims.

use crate::native::NativeRegistry;
use crate::process::{Frame, Process};
use bytecode_system::{Opcode, Program};
use core_types::{ErrorKind, ProcessId, RuntimeError, Value};
use memory_manager::Heap;

/// What one instruction did, beyond mutating the process.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Normal instruction; the process keeps running
    Continue,
    /// `spawn-agent` executed; the scheduler must create the process and
    /// push its handle onto this process's stack
    SpawnAgent {
        /// Agent table index
        def: u16,
    },
    /// `agent-send` executed; the scheduler must submit the request and
    /// suspend both sides
    AgentSend {
        /// Target agent process
        agent: ProcessId,
        /// Rendered message text
        message: String,
    },
    /// The outermost frame returned; the process is done
    Terminated(Value),
}

/// Executes one instruction of `proc`.
///
/// On error the process's instruction cursor has already advanced; the
/// error carries the offset of the faulting instruction.
pub fn step(
    proc: &mut Process,
    program: &Program,
    consts: &[Value],
    heap: &mut Heap,
    natives: &NativeRegistry,
    globals: &mut Vec<Value>,
) -> Result<StepOutcome, RuntimeError> {
    let pid = proc.id;
    let (op, offset) = fetch(proc, program).map_err(|kind| RuntimeError {
        pid,
        offset: proc.current_offset(),
        kind,
    })?;
    exec(op, proc, program, consts, heap, natives, globals)
        .map_err(|kind| RuntimeError { pid, offset, kind })
}

/// Reads the next instruction and advances the cursor past it.
fn fetch(proc: &mut Process, program: &Program) -> Result<(Opcode, usize), ErrorKind> {
    let frame = top(proc)?;
    let func = program
        .functions
        .get(frame.function)
        .ok_or_else(|| ErrorKind::Internal(format!("frame on unknown function {}", frame.function)))?;
    let offset = frame.pc;
    if offset < func.code_offset || offset >= func.code_offset + func.code_len {
        return Err(ErrorKind::InvalidCursor);
    }
    frame.pc = offset + 1;
    Ok((program.code[offset].clone(), offset))
}

fn top(proc: &mut Process) -> Result<&mut Frame, ErrorKind> {
    proc.frames
        .last_mut()
        .ok_or_else(|| ErrorKind::Internal("no active frame".to_string()))
}

fn pop(frame: &mut Frame) -> Result<Value, ErrorKind> {
    frame.stack.pop().ok_or(ErrorKind::StackUnderflow)
}

/// Pops `n` values in push order (first pushed first).
fn pop_n(frame: &mut Frame, n: usize) -> Result<Vec<Value>, ErrorKind> {
    if frame.stack.len() < n {
        return Err(ErrorKind::StackUnderflow);
    }
    Ok(frame.stack.split_off(frame.stack.len() - n))
}

enum Num {
    Ints(i64, i64),
    Floats(f64, f64),
}

/// Int/Float promotion: mixed operands compute in Float.
fn numeric(a: &Value, b: &Value) -> Option<Num> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(Num::Ints(*x, *y)),
        (Value::Float(x), Value::Float(y)) => Some(Num::Floats(*x, *y)),
        (Value::Int(x), Value::Float(y)) => Some(Num::Floats(*x as f64, *y)),
        (Value::Float(x), Value::Int(y)) => Some(Num::Floats(*x, *y as f64)),
        _ => None,
    }
}

fn release_all(heap: &mut Heap, values: impl IntoIterator<Item = Value>) {
    for v in values {
        heap.release(v);
    }
}

fn binary_type_error(op: &str, a: &Value, b: &Value) -> ErrorKind {
    ErrorKind::TypeMismatch(format!(
        "cannot {op} {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

#[allow(clippy::too_many_lines)]
fn exec(
    op: Opcode,
    proc: &mut Process,
    program: &Program,
    consts: &[Value],
    heap: &mut Heap,
    natives: &NativeRegistry,
    globals: &mut Vec<Value>,
) -> Result<StepOutcome, ErrorKind> {
    match op {
        Opcode::PushConst(idx) => {
            let value = consts
                .get(idx)
                .cloned()
                .ok_or_else(|| ErrorKind::Internal(format!("constant {idx} out of range")))?;
            heap.retain(&value);
            top(proc)?.stack.push(value);
        }
        Opcode::PushNull => top(proc)?.stack.push(Value::Null),
        Opcode::PushTrue => top(proc)?.stack.push(Value::Bool(true)),
        Opcode::PushFalse => top(proc)?.stack.push(Value::Bool(false)),
        Opcode::PushFunction(idx) => top(proc)?.stack.push(Value::Function(usize::from(idx))),

        Opcode::Pop => {
            let v = pop(top(proc)?)?;
            heap.release(v);
        }
        Opcode::Dup => {
            let frame = top(proc)?;
            let v = frame.stack.last().cloned().ok_or(ErrorKind::StackUnderflow)?;
            heap.retain(&v);
            frame.stack.push(v);
        }

        Opcode::LoadLocal(idx) => {
            let frame = top(proc)?;
            let v = frame
                .locals
                .get(usize::from(idx))
                .cloned()
                .ok_or_else(|| ErrorKind::Internal(format!("local slot {idx} out of range")))?;
            heap.retain(&v);
            frame.stack.push(v);
        }
        Opcode::StoreLocal(idx) => {
            let frame = top(proc)?;
            let v = pop(frame)?;
            let slot = usize::from(idx);
            if slot >= frame.locals.len() {
                heap.release(v);
                return Err(ErrorKind::Internal(format!("local slot {idx} out of range")));
            }
            let old = std::mem::replace(&mut frame.locals[slot], v);
            heap.release(old);
        }
        Opcode::LoadGlobal(idx) => {
            // Unset globals read as null.
            let v = globals.get(usize::from(idx)).cloned().unwrap_or(Value::Null);
            heap.retain(&v);
            top(proc)?.stack.push(v);
        }
        Opcode::StoreGlobal(idx) => {
            let v = pop(top(proc)?)?;
            let slot = usize::from(idx);
            if slot >= globals.len() {
                globals.resize(slot + 1, Value::Null);
            }
            let old = std::mem::replace(&mut globals[slot], v);
            heap.release(old);
        }

        Opcode::Add => {
            let frame = top(proc)?;
            let b = pop(frame)?;
            let a = pop(frame).map_err(|e| {
                heap.release(b.clone());
                e
            })?;
            let result = match numeric(&a, &b) {
                Some(Num::Ints(x, y)) => Value::Int(x.wrapping_add(y)),
                Some(Num::Floats(x, y)) => Value::Float(x + y),
                None => match (&a, &b) {
                    (Value::Str(_), Value::Str(_)) => heap.concat(&a, &b).map_err(|e| {
                        release_all(heap, [a.clone(), b.clone()]);
                        e
                    })?,
                    _ => {
                        let e = binary_type_error("add", &a, &b);
                        release_all(heap, [a, b]);
                        return Err(e);
                    }
                },
            };
            release_all(heap, [a, b]);
            top(proc)?.stack.push(result);
        }
        Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            let frame = top(proc)?;
            let b = pop(frame)?;
            let a = pop(frame).map_err(|e| {
                heap.release(b.clone());
                e
            })?;
            let result = arith(&op, &a, &b);
            release_all(heap, [a, b]);
            top(proc)?.stack.push(result?);
        }
        Opcode::Neg => {
            let v = pop(top(proc)?)?;
            let result = match &v {
                Value::Int(x) => Ok(Value::Int(x.wrapping_neg())),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => Err(ErrorKind::TypeMismatch(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
            };
            heap.release(v);
            top(proc)?.stack.push(result?);
        }

        Opcode::Not => {
            let v = pop(top(proc)?)?;
            let t = heap.truthy(&v);
            heap.release(v);
            top(proc)?.stack.push(Value::Bool(!t));
        }
        Opcode::And | Opcode::Or => {
            let frame = top(proc)?;
            let b = pop(frame)?;
            let a = pop(frame).map_err(|e| {
                heap.release(b.clone());
                e
            })?;
            let (ta, tb) = (heap.truthy(&a), heap.truthy(&b));
            release_all(heap, [a, b]);
            let result = if matches!(op, Opcode::And) { ta && tb } else { ta || tb };
            top(proc)?.stack.push(Value::Bool(result));
        }

        Opcode::Equal | Opcode::NotEqual => {
            let frame = top(proc)?;
            let b = pop(frame)?;
            let a = pop(frame).map_err(|e| {
                heap.release(b.clone());
                e
            })?;
            let eq = heap.values_equal(&a, &b);
            release_all(heap, [a, b]);
            let result = if matches!(op, Opcode::Equal) { eq } else { !eq };
            top(proc)?.stack.push(Value::Bool(result));
        }
        Opcode::Less | Opcode::LessEqual | Opcode::Greater | Opcode::GreaterEqual => {
            let frame = top(proc)?;
            let b = pop(frame)?;
            let a = pop(frame).map_err(|e| {
                heap.release(b.clone());
                e
            })?;
            let ord = match numeric(&a, &b) {
                Some(Num::Ints(x, y)) => Some(x.cmp(&y)),
                Some(Num::Floats(x, y)) => x.partial_cmp(&y),
                None => match (&a, &b) {
                    (Value::Str(_), Value::Str(_)) => {
                        let cmp = heap
                            .get_str(&a)
                            .and_then(|x| heap.get_str(&b).map(|y| x.cmp(y)));
                        match cmp {
                            Ok(o) => Some(o),
                            Err(e) => {
                                release_all(heap, [a, b]);
                                return Err(e);
                            }
                        }
                    }
                    _ => {
                        let e = binary_type_error("compare", &a, &b);
                        release_all(heap, [a, b]);
                        return Err(e);
                    }
                },
            };
            release_all(heap, [a, b]);
            // NaN compares false under every ordering.
            let result = ord.is_some_and(|o| match op {
                Opcode::Less => o.is_lt(),
                Opcode::LessEqual => o.is_le(),
                Opcode::Greater => o.is_gt(),
                _ => o.is_ge(),
            });
            top(proc)?.stack.push(Value::Bool(result));
        }

        Opcode::Jump(target) => jump(proc, program, target)?,
        Opcode::JumpIfTrue(target) | Opcode::JumpIfFalse(target) => {
            let v = pop(top(proc)?)?;
            let t = heap.truthy(&v);
            heap.release(v);
            let taken = if matches!(op, Opcode::JumpIfTrue(_)) { t } else { !t };
            if taken {
                jump(proc, program, target)?;
            }
        }

        Opcode::Call(argc) => {
            let frame = top(proc)?;
            let mut args = pop_n(frame, usize::from(argc))?;
            let callee = match pop(frame) {
                Ok(v) => v,
                Err(e) => {
                    release_all(heap, args);
                    return Err(e);
                }
            };
            let fidx = match callee {
                Value::Function(idx) => idx,
                other => {
                    let e = ErrorKind::TypeMismatch(format!(
                        "cannot call {}",
                        other.type_name()
                    ));
                    args.push(other);
                    release_all(heap, args);
                    return Err(e);
                }
            };
            let fdef = match program.functions.get(fidx) {
                Some(f) => f,
                None => {
                    release_all(heap, args);
                    return Err(ErrorKind::UnknownFunction(fidx.to_string()));
                }
            };
            if fdef.arity != argc {
                let e = ErrorKind::ArityMismatch {
                    callee: fdef.name.clone(),
                    expected: fdef.arity,
                    got: argc,
                };
                release_all(heap, args);
                return Err(e);
            }
            proc.frames
                .push(Frame::new(fidx, fdef.code_offset, fdef.locals, args));
        }
        Opcode::Return => {
            let frame = top(proc)?;
            let ret = frame.stack.pop().unwrap_or(Value::Null);
            let mut done = match proc.frames.pop() {
                Some(f) => f,
                None => return Err(ErrorKind::Internal("return without frame".to_string())),
            };
            release_all(heap, done.locals.drain(..));
            release_all(heap, done.stack.drain(..));
            match proc.frames.last_mut() {
                Some(caller) => caller.stack.push(ret),
                None => return Ok(StepOutcome::Terminated(ret)),
            }
        }
        Opcode::CallNative(id, argc) => {
            let args = pop_n(top(proc)?, usize::from(argc))?;
            let cap = match natives.get(id) {
                Some(c) => c,
                None => {
                    release_all(heap, args);
                    return Err(ErrorKind::UnknownNative(id));
                }
            };
            if cap.arity != argc {
                let e = ErrorKind::ArityMismatch {
                    callee: cap.name.clone(),
                    expected: cap.arity,
                    got: argc,
                };
                release_all(heap, args);
                return Err(e);
            }
            let result = (cap.func)(heap, &args);
            release_all(heap, args);
            top(proc)?.stack.push(result?);
        }

        Opcode::SpawnAgent(def) => {
            if usize::from(def) >= program.agents.len() {
                return Err(ErrorKind::Internal(format!(
                    "agent table index {def} out of range"
                )));
            }
            return Ok(StepOutcome::SpawnAgent { def });
        }
        Opcode::AgentSend => {
            let frame = top(proc)?;
            let message = pop(frame)?;
            let handle = match pop(frame) {
                Ok(v) => v,
                Err(e) => {
                    heap.release(message);
                    return Err(e);
                }
            };
            let agent = match handle {
                Value::Agent(pid) => pid,
                other => {
                    let e = ErrorKind::TypeMismatch(format!(
                        "agent-send target is {}, not an agent",
                        other.type_name()
                    ));
                    release_all(heap, [other, message]);
                    return Err(e);
                }
            };
            let text = heap.display(&message);
            heap.release(message);
            return Ok(StepOutcome::AgentSend { agent, message: text });
        }

        Opcode::MakeArray(n) => {
            let items = pop_n(top(proc)?, usize::from(n))?;
            let array = heap.alloc_array(items);
            top(proc)?.stack.push(array);
        }
        Opcode::MakeObject(n) => {
            let mut flat = pop_n(top(proc)?, usize::from(n) * 2)?;
            let mut fields = Vec::with_capacity(usize::from(n));
            while !flat.is_empty() {
                let key = flat.remove(0);
                let value = flat.remove(0);
                let name = match heap.get_str(&key) {
                    Ok(s) => s.to_string(),
                    Err(e) => {
                        release_all(heap, [key, value]);
                        release_all(heap, flat);
                        release_all(heap, fields.into_iter().map(|(_, v)| v));
                        return Err(e);
                    }
                };
                heap.release(key);
                fields.push((name, value));
            }
            let object = heap.alloc_object(fields);
            top(proc)?.stack.push(object);
        }
        Opcode::GetIndex => {
            let frame = top(proc)?;
            let index = pop(frame)?;
            let container = pop(frame).map_err(|e| {
                heap.release(index.clone());
                e
            })?;
            let result = heap.index_get(&container, &index);
            release_all(heap, [container, index]);
            top(proc)?.stack.push(result?);
        }
        Opcode::SetIndex => {
            let frame = top(proc)?;
            let value = pop(frame)?;
            let index = match pop(frame) {
                Ok(v) => v,
                Err(e) => {
                    heap.release(value);
                    return Err(e);
                }
            };
            let container = match pop(frame) {
                Ok(v) => v,
                Err(e) => {
                    release_all(heap, [value, index]);
                    return Err(e);
                }
            };
            // index_set owns `value` on every path.
            let result = heap.index_set(&container, &index, value);
            release_all(heap, [container, index]);
            result?;
        }
        Opcode::GetField(cidx) => {
            let name = field_name(consts, heap, cidx)?;
            let container = pop(top(proc)?)?;
            let result = heap.field_get(&container, &name);
            heap.release(container);
            top(proc)?.stack.push(result?);
        }
        Opcode::SetField(cidx) => {
            let name = field_name(consts, heap, cidx)?;
            let frame = top(proc)?;
            let value = pop(frame)?;
            let container = match pop(frame) {
                Ok(v) => v,
                Err(e) => {
                    heap.release(value);
                    return Err(e);
                }
            };
            let result = heap.field_set(&container, &name, value);
            heap.release(container);
            result?;
        }

        Opcode::Print => {
            let v = pop(top(proc)?)?;
            println!("{}", heap.display(&v));
            heap.release(v);
        }
    }
    Ok(StepOutcome::Continue)
}

fn arith(op: &Opcode, a: &Value, b: &Value) -> Result<Value, ErrorKind> {
    let name = match op {
        Opcode::Sub => "subtract",
        Opcode::Mul => "multiply",
        Opcode::Div => "divide",
        _ => "take modulo of",
    };
    match numeric(a, b) {
        Some(Num::Ints(x, y)) => match op {
            Opcode::Sub => Ok(Value::Int(x.wrapping_sub(y))),
            Opcode::Mul => Ok(Value::Int(x.wrapping_mul(y))),
            Opcode::Div if y == 0 => Err(ErrorKind::DivisionByZero),
            Opcode::Div => Ok(Value::Int(x.wrapping_div(y))),
            _ if y == 0 => Err(ErrorKind::DivisionByZero),
            _ => Ok(Value::Int(x.wrapping_rem(y))),
        },
        Some(Num::Floats(x, y)) => match op {
            Opcode::Sub => Ok(Value::Float(x - y)),
            Opcode::Mul => Ok(Value::Float(x * y)),
            Opcode::Div => Ok(Value::Float(x / y)),
            _ => Ok(Value::Float(x % y)),
        },
        None => Err(binary_type_error(name, a, b)),
    }
}

/// Overwrites the cursor with a function-relative target.
fn jump(proc: &mut Process, program: &Program, target: usize) -> Result<(), ErrorKind> {
    let frame = top(proc)?;
    let func = &program.functions[frame.function];
    if target >= func.code_len {
        return Err(ErrorKind::InvalidJump(target));
    }
    frame.pc = func.code_offset + target;
    Ok(())
}

/// Resolves a field-name constant to its string.
fn field_name(consts: &[Value], heap: &Heap, idx: usize) -> Result<String, ErrorKind> {
    let value = consts
        .get(idx)
        .ok_or_else(|| ErrorKind::Internal(format!("constant {idx} out of range")))?;
    Ok(heap.get_str(value)?.to_string())
}

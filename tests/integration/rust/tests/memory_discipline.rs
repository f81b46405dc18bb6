//! Memory Manager to Interpreter Integration Tests
//!
//! Verifies the reference-count discipline across instruction execution:
//! what a process touches is released when it pops, stores over, faults,
//! or terminates. `live_objects` counts occupied heap slots, so these
//! tests can assert exact survivor sets.

use agent_runtime::{LlmResponse, StubTransport};
use bytecode_system::{AgentDef, Const, Opcode, Program, ProgramBuilder};
use core_types::Value;
use interpreter::{ExitStatus, Vm};

fn run(program: Program) -> (Vm, ExitStatus) {
    let mut vm = Vm::new(program, Box::new(StubTransport::new()));
    let pid = vm.run("main", vec![]).expect("spawn failed");
    let exit = vm.exit_status(pid).cloned().expect("no exit");
    (vm, exit)
}

/// Test: a scalar-only program leaves the heap empty
#[test]
fn test_scalar_program_leaves_no_objects() {
    let mut b = ProgramBuilder::new();
    let one = b.add_constant(Const::Int(1));
    let two = b.add_constant(Const::Int(2));
    b.begin_function("main", 0, 1);
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(two));
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    assert_eq!(exit, ExitStatus::Done(Value::Int(3)));
    assert_eq!(vm.heap().live_objects(), 0);
}

/// Test: temporaries built and popped during execution are reclaimed;
/// only interned constants survive
#[test]
fn test_dropped_temporaries_are_reclaimed() {
    let mut b = ProgramBuilder::new();
    let s = b.add_constant(Const::Str("scratch".to_string()));
    b.begin_function("main", 0, 0);
    // Build an array of two string copies, then discard it.
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::MakeArray(2));
    b.emit(Opcode::Pop);
    b.emit(Opcode::PushNull);
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    assert_eq!(exit, ExitStatus::Done(Value::Null));
    // One slot: the interned "scratch" held by the constant table.
    assert_eq!(vm.heap().live_objects(), 1);
}

/// Test: a returned container stays alive through the exit record
#[test]
fn test_exit_value_keeps_its_count() {
    let mut b = ProgramBuilder::new();
    let one = b.add_constant(Const::Int(1));
    b.begin_function("main", 0, 0);
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::MakeArray(1));
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    match exit {
        ExitStatus::Done(v) => {
            let id = v.heap_id().expect("not a heap value");
            assert_eq!(vm.heap().refcount(id), Some(1));
            assert_eq!(vm.display(&v), "[1]");
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(vm.heap().live_objects(), 1);
}

/// Test: a faulting process releases everything it held
#[test]
fn test_fault_releases_process_values() {
    let mut b = ProgramBuilder::new();
    let s = b.add_constant(Const::Str("held".to_string()));
    let one = b.add_constant(Const::Int(1));
    let zero = b.add_constant(Const::Int(0));
    b.begin_function("main", 0, 1);
    // Hold a fresh array in a local and on the stack, then fault.
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::MakeArray(1));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::PushConst(zero));
    b.emit(Opcode::Div);
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    assert!(matches!(exit, ExitStatus::Failed(_)));
    // Only the interned "held" remains; the array and its element copy
    // were released at reap time.
    assert_eq!(vm.heap().live_objects(), 1);
}

/// Test: overwriting an array element releases the old element
#[test]
fn test_set_index_releases_overwritten_value() {
    let mut b = ProgramBuilder::new();
    let a = b.add_constant(Const::Str("old".to_string()));
    let c = b.add_constant(Const::Str("new".to_string()));
    let zero = b.add_constant(Const::Int(0));
    b.begin_function("main", 0, 1);
    b.emit(Opcode::PushConst(a));
    b.emit(Opcode::MakeArray(1));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(zero));
    b.emit(Opcode::PushConst(c));
    b.emit(Opcode::SetIndex);
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(zero));
    b.emit(Opcode::GetIndex);
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    match exit {
        ExitStatus::Done(v) => assert_eq!(vm.display(&v), "new"),
        other => panic!("expected done, got {other:?}"),
    }
    // Interned "old" and "new" plus the returned copy of "new" sharing
    // its slot: two live slots, array reclaimed at process exit.
    assert_eq!(vm.heap().live_objects(), 2);
}

/// Test: the reply value delivered by an exchange is owned by the caller
/// and survives exactly as the exit value
#[test]
fn test_reply_value_ownership() {
    let mut b = ProgramBuilder::new();
    let ping = b.add_constant(Const::Str("ping".to_string()));
    b.begin_function("main", 0, 1);
    b.emit(Opcode::SpawnAgent(0));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(ping));
    b.emit(Opcode::AgentSend);
    b.emit(Opcode::Return);
    b.finish_function();
    b.add_agent(AgentDef {
        name: "helper".to_string(),
        model: "vega-small".to_string(),
        system_prompt: String::new(),
        temperature: 0.0,
        tools: vec![],
    });

    let mut vm = Vm::new(
        b.finish(),
        Box::new(StubTransport::auto(|_| Ok(LlmResponse::text("pong")))),
    );
    let pid = vm.run("main", vec![]).expect("spawn failed");

    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => {
            let id = v.heap_id().expect("reply not on heap");
            // Exactly the exit record's count.
            assert_eq!(vm.heap().refcount(id), Some(1));
        }
        other => panic!("expected done, got {other:?}"),
    }
    // Interned "ping" plus the reply string.
    assert_eq!(vm.heap().live_objects(), 2);
}

/// Test: a self-referential container built through SetIndex can be
/// rendered without bringing the engine down
#[test]
fn test_cyclic_container_survives_display() {
    let mut b = ProgramBuilder::new();
    let zero = b.add_constant(Const::Int(0));
    b.begin_function("main", 0, 1);
    b.emit(Opcode::PushNull);
    b.emit(Opcode::MakeArray(1));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(zero));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::SetIndex); // a[0] = a
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    match exit {
        ExitStatus::Done(v) => assert_eq!(vm.display(&v), "[[...]]"),
        other => panic!("expected done, got {other:?}"),
    }
    // The self-loop keeps the array alive past the process; heap
    // teardown reclaims it with the Vm.
    assert_eq!(vm.heap().live_objects(), 1);
}

/// Test: heap ids freed by one process can be reused safely afterwards
#[test]
fn test_slot_reuse_after_release() {
    let mut b = ProgramBuilder::new();
    let s = b.add_constant(Const::Str("x".to_string()));
    b.begin_function("main", 0, 0);
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::Add); // fresh concat slot
    b.emit(Opcode::Pop); // freed again
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::PushConst(s));
    b.emit(Opcode::Add); // reuses the freed slot
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run(b.finish());
    match exit {
        ExitStatus::Done(v) => assert_eq!(vm.display(&v), "xx"),
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(vm.heap().live_objects(), 2);
}

//! Bytecode to Interpreter Integration Tests
//!
//! Verifies that programs assembled with `ProgramBuilder` execute
//! correctly through the VM: arithmetic, control flow, function calls,
//! containers, and native capabilities.

use agent_runtime::StubTransport;
use bytecode_system::{Const, Opcode, Program, ProgramBuilder};
use core_types::{ErrorKind, Value};
use interpreter::{ExitStatus, Vm};

fn vm(program: Program) -> Vm {
    Vm::new(program, Box::new(StubTransport::new()))
}

fn run_main(program: Program) -> (Vm, ExitStatus) {
    let mut vm = vm(program);
    let pid = vm.run("main", vec![]).expect("spawn failed");
    let exit = vm.exit_status(pid).cloned().expect("no exit status");
    (vm, exit)
}

/// Test: spawn a two-argument function and collect its return value
#[test]
fn test_add_two_arguments() {
    let mut b = ProgramBuilder::new();
    b.begin_function("add", 2, 2);
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::LoadLocal(1));
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    b.finish_function();

    let mut vm = vm(b.finish());
    let pid = vm
        .spawn("add", vec![Value::Int(2), Value::Int(3)])
        .expect("spawn failed");
    vm.run_until_quiescent();

    assert_eq!(vm.exit_status(pid), Some(&ExitStatus::Done(Value::Int(5))));
}

/// Test: a counting loop with a conditional back-edge
#[test]
fn test_loop_counts_to_ten() {
    let mut b = ProgramBuilder::new();
    let zero = b.add_constant(Const::Int(0));
    let one = b.add_constant(Const::Int(1));
    let ten = b.add_constant(Const::Int(10));

    b.begin_function("main", 0, 1);
    b.emit(Opcode::PushConst(zero));
    b.emit(Opcode::StoreLocal(0));
    let top = b.next_offset();
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(ten));
    b.emit(Opcode::Less);
    let exit = b.next_offset();
    b.emit(Opcode::JumpIfFalse(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::Add);
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::Jump(top));
    b.patch_jump(exit);
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::Return);
    b.finish_function();

    let (_, exit) = run_main(b.finish());
    assert_eq!(exit, ExitStatus::Done(Value::Int(10)));
}

/// Test: nested function calls (recursion) work through the frame stack
#[test]
fn test_recursive_factorial() {
    let mut b = ProgramBuilder::new();
    let one = b.add_constant(Const::Int(1));
    let two = b.add_constant(Const::Int(2));
    let five = b.add_constant(Const::Int(5));

    // fact(n) = if n < 2 { 1 } else { n * fact(n - 1) }
    b.begin_function("fact", 1, 1);
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(two));
    b.emit(Opcode::Less);
    let else_jump = b.next_offset();
    b.emit(Opcode::JumpIfFalse(0));
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::Return);
    b.patch_jump(else_jump);
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushFunction(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::Sub);
    b.emit(Opcode::Call(1));
    b.emit(Opcode::Mul);
    b.emit(Opcode::Return);
    b.finish_function();

    b.begin_function("main", 0, 0);
    b.emit(Opcode::PushFunction(0));
    b.emit(Opcode::PushConst(five));
    b.emit(Opcode::Call(1));
    b.emit(Opcode::Return);
    b.finish_function();

    let (_, exit) = run_main(b.finish());
    assert_eq!(exit, ExitStatus::Done(Value::Int(120)));
}

/// Test: string constants concatenate and display without quotes
#[test]
fn test_string_concatenation() {
    let mut b = ProgramBuilder::new();
    let hello = b.add_constant(Const::Str("hello ".to_string()));
    let world = b.add_constant(Const::Str("world".to_string()));
    b.begin_function("main", 0, 0);
    b.emit(Opcode::PushConst(hello));
    b.emit(Opcode::PushConst(world));
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    b.finish_function();

    let (vm, exit) = run_main(b.finish());
    match exit {
        ExitStatus::Done(v) => assert_eq!(vm.display(&v), "hello world"),
        other => panic!("expected done, got {other:?}"),
    }
}

/// Test: arrays and objects round through index and field instructions
#[test]
fn test_container_instructions() {
    let mut b = ProgramBuilder::new();
    let name = b.add_constant(Const::Str("items".to_string()));
    let one = b.add_constant(Const::Int(1));
    let two = b.add_constant(Const::Int(2));

    // main() { o = { items: [1, 2] }; return o.items[1] }
    b.begin_function("main", 0, 1);
    b.emit(Opcode::PushConst(name));
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::PushConst(two));
    b.emit(Opcode::MakeArray(2));
    b.emit(Opcode::MakeObject(1));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::GetField(name));
    b.emit(Opcode::PushConst(one));
    b.emit(Opcode::GetIndex);
    b.emit(Opcode::Return);
    b.finish_function();

    let (_, exit) = run_main(b.finish());
    assert_eq!(exit, ExitStatus::Done(Value::Int(2)));
}

/// Test: a registered native capability is callable from bytecode
#[test]
fn test_native_capability_call() {
    let mut b = ProgramBuilder::new();
    let csv = b.add_constant(Const::Str("a,b,c".to_string()));
    let comma = b.add_constant(Const::Str(",".to_string()));
    b.begin_function("main", 0, 0);
    b.emit(Opcode::PushConst(csv));
    b.emit(Opcode::PushConst(comma));
    b.emit(Opcode::CallNative(0, 2));
    b.emit(Opcode::Return);
    b.finish_function();

    let mut vm = vm(b.finish());
    vm.register_native(0, "split", 2, |heap, args| heap.split(&args[0], &args[1]));
    let pid = vm.run("main", vec![]).expect("spawn failed");

    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => {
            assert_eq!(vm.heap().array_len(&v).unwrap(), 3);
            assert_eq!(vm.display(&v), "[a, b, c]");
        }
        other => panic!("expected array, got {other:?}"),
    }
}

/// Test: calling an unregistered native id fails only the caller
#[test]
fn test_unknown_native_fails_process() {
    let mut b = ProgramBuilder::new();
    b.begin_function("main", 0, 0);
    b.emit(Opcode::CallNative(42, 0));
    b.emit(Opcode::Return);
    b.finish_function();

    let (_, exit) = run_main(b.finish());
    match exit {
        ExitStatus::Failed(err) => {
            assert_eq!(err.kind, ErrorKind::UnknownNative(42));
            assert_eq!(err.offset, 0);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

/// Test: an out-of-range index faults with the offending detail
#[test]
fn test_index_out_of_range() {
    let mut b = ProgramBuilder::new();
    let five = b.add_constant(Const::Int(5));
    b.begin_function("main", 0, 0);
    b.emit(Opcode::MakeArray(0));
    b.emit(Opcode::PushConst(five));
    b.emit(Opcode::GetIndex);
    b.emit(Opcode::Return);
    b.finish_function();

    let (_, exit) = run_main(b.finish());
    match exit {
        ExitStatus::Failed(err) => match err.kind {
            ErrorKind::IndexOutOfRange(detail) => {
                assert!(detail.contains('5'), "detail was {detail}");
            }
            other => panic!("expected index error, got {other:?}"),
        },
        other => panic!("expected failure, got {other:?}"),
    }
}

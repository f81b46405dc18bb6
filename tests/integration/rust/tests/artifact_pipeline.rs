//! Artifact to VM Integration Tests
//!
//! Round-trips full programs (agents and tools included) through the
//! binary artifact format and executes them, and verifies that corrupt
//! artifacts are rejected at load time rather than at run time.

use agent_runtime::{LlmResponse, StubTransport};
use bytecode_system::{artifact, AgentDef, Const, LoadError, Opcode, Program, ProgramBuilder};
use core_types::Value;
use interpreter::{ExitStatus, Vm};

fn agent_program() -> Program {
    let mut b = ProgramBuilder::new();
    let ping = b.add_constant(Const::Str("ping".to_string()));
    let prefix = b.add_constant(Const::Str("got:".to_string()));
    b.begin_function("main", 0, 1);
    b.emit(Opcode::SpawnAgent(0));
    b.emit(Opcode::StoreLocal(0));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::PushConst(ping));
    b.emit(Opcode::AgentSend);
    b.emit(Opcode::Return);
    b.finish_function();
    b.begin_function("lookup", 1, 1);
    b.emit(Opcode::PushConst(prefix));
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    b.finish_function();
    b.add_agent(AgentDef {
        name: "helper".to_string(),
        model: "vega-small".to_string(),
        system_prompt: "use tools".to_string(),
        temperature: 0.7,
        tools: vec![1],
    });
    b.finish()
}

/// Test: a loaded artifact runs a complete tool exchange identically to
/// the in-memory program
#[test]
fn test_artifact_runs_tool_exchange() {
    let bytes = artifact::to_bytes(&agent_program());

    let mut calls = 0;
    let transport = StubTransport::auto(move |_| {
        calls += 1;
        if calls == 1 {
            Ok(LlmResponse::tool("lookup", serde_json::json!(["thing"])))
        } else {
            Ok(LlmResponse::text("done"))
        }
    });

    let mut vm = Vm::from_artifact(&bytes, Box::new(transport)).expect("load failed");
    let pid = vm.run("main", vec![]).expect("spawn failed");

    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "done"),
        other => panic!("expected done, got {other:?}"),
    }
    let agent = vm.process_ids()[0];
    let history = vm.agent_history(agent).expect("agent reaped");
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].content, "got:thing");
}

/// Test: agent definitions survive the binary round trip intact
#[test]
fn test_agent_table_round_trip() {
    let program = agent_program();
    let loaded = artifact::load(&artifact::to_bytes(&program)).expect("load failed");
    assert_eq!(loaded, program);
    assert_eq!(loaded.agents[0].name, "helper");
    assert_eq!(loaded.agents[0].temperature, 0.7);
    assert_eq!(loaded.agents[0].tools, vec![1]);
}

/// Test: a wrong magic number is rejected before anything executes
#[test]
fn test_bad_magic_rejected() {
    let mut bytes = artifact::to_bytes(&agent_program());
    bytes[0] = b'X';
    assert!(matches!(
        Vm::from_artifact(&bytes, Box::new(StubTransport::new())),
        Err(LoadError::BadMagic)
    ));
}

/// Test: a truncated artifact is rejected with a load error, not a panic
#[test]
fn test_truncated_artifact_rejected() {
    let bytes = artifact::to_bytes(&agent_program());
    for len in [0, 3, 7, bytes.len() / 2, bytes.len() - 1] {
        assert!(
            artifact::load(&bytes[..len]).is_err(),
            "length {len} should not load"
        );
    }
}

/// Test: function arity and entry points survive the round trip and
/// still gate spawning
#[test]
fn test_loaded_functions_keep_arity() {
    let bytes = artifact::to_bytes(&agent_program());
    let mut vm = Vm::from_artifact(&bytes, Box::new(StubTransport::new())).expect("load failed");

    // lookup takes one argument; spawning with none is refused.
    assert!(vm.spawn("lookup", vec![]).is_err());
    let arg = vm.heap_mut().alloc_str("x");
    let pid = vm.spawn("lookup", vec![arg]).expect("spawn failed");
    vm.run_until_quiescent();
    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "got:x"),
        other => panic!("expected done, got {other:?}"),
    }
}

/// Test: a program with every opcode category round-trips bit-exact
#[test]
fn test_full_opcode_coverage_round_trip() {
    let mut b = ProgramBuilder::new();
    let c0 = b.add_constant(Const::Null);
    let c1 = b.add_constant(Const::Bool(true));
    let c2 = b.add_constant(Const::Int(-5));
    let c3 = b.add_constant(Const::Float(2.25));
    let c4 = b.add_constant(Const::Str("s".to_string()));
    b.begin_function("everything", 1, 3);
    for op in [
        Opcode::PushConst(c0),
        Opcode::PushConst(c1),
        Opcode::PushConst(c2),
        Opcode::PushConst(c3),
        Opcode::PushConst(c4),
        Opcode::PushNull,
        Opcode::PushTrue,
        Opcode::PushFalse,
        Opcode::PushFunction(0),
        Opcode::Pop,
        Opcode::Dup,
        Opcode::LoadLocal(0),
        Opcode::StoreLocal(1),
        Opcode::LoadGlobal(2),
        Opcode::StoreGlobal(2),
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::Neg,
        Opcode::Not,
        Opcode::And,
        Opcode::Or,
        Opcode::Equal,
        Opcode::NotEqual,
        Opcode::Less,
        Opcode::LessEqual,
        Opcode::Greater,
        Opcode::GreaterEqual,
        Opcode::Jump(0),
        Opcode::JumpIfTrue(1),
        Opcode::JumpIfFalse(2),
        Opcode::Call(2),
        Opcode::Return,
        Opcode::CallNative(7, 1),
        Opcode::SpawnAgent(0),
        Opcode::AgentSend,
        Opcode::MakeArray(3),
        Opcode::MakeObject(2),
        Opcode::GetIndex,
        Opcode::SetIndex,
        Opcode::GetField(c4),
        Opcode::SetField(c4),
        Opcode::Print,
    ] {
        b.emit(op);
    }
    b.finish_function();
    b.add_agent(AgentDef {
        name: "a".to_string(),
        model: "m".to_string(),
        system_prompt: String::new(),
        temperature: 1.0,
        tools: vec![0],
    });
    let program = b.finish();

    let loaded = artifact::load(&artifact::to_bytes(&program)).expect("load failed");
    assert_eq!(loaded, program);
}

//! Agent Exchange Integration Tests
//!
//! Drives full agent-send cycles through the VM and a scripted
//! transport: text replies, tool round trips, failure blast radius, and
//! the discard rules for dangling and duplicate completions.

use std::cell::RefCell;
use std::rc::Rc;

use agent_runtime::{
    Completion, CompletionQueue, LlmRequest, LlmResponse, LlmTransport, RequestHandle, Role,
    StubTransport, TransportError,
};
use bytecode_system::{AgentDef, Const, Opcode, Program, ProgramBuilder};
use core_types::{ErrorKind, ProcessId, RuntimeError, Value};
use interpreter::{ExitStatus, Vm, WaitReason};

/// Transport the test keeps a handle to while the VM owns the other end.
struct SharedTransport(Rc<RefCell<StubTransport>>);

impl LlmTransport for SharedTransport {
    fn submit(&mut self, request: LlmRequest) -> RequestHandle {
        self.0.borrow_mut().submit(request)
    }

    fn poll(&mut self) -> Vec<Completion> {
        self.0.borrow_mut().poll()
    }
}

fn shared() -> (Rc<RefCell<StubTransport>>, Box<dyn LlmTransport>) {
    let inner = Rc::new(RefCell::new(StubTransport::new()));
    (Rc::clone(&inner), Box::new(SharedTransport(inner)))
}

/// main() { a = spawn-agent 0; return a <- "ping" }
fn send_program(tools: Vec<u16>) -> Program {
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
        system_prompt: "be brief".to_string(),
        temperature: 0.2,
        tools,
    });
    b.finish()
}

/// Test: a text reply resumes the caller with the reply string and
/// leaves a two-entry history on the idle agent
#[test]
fn test_text_reply_roundtrip() {
    let mut vm = Vm::new(
        send_program(vec![]),
        Box::new(StubTransport::always_text("pong")),
    );
    let pid = vm.run("main", vec![]).expect("spawn failed");

    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "pong"),
        other => panic!("expected done, got {other:?}"),
    }

    let agent = vm.process_ids()[0];
    let history = vm.agent_history(agent).expect("agent reaped");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "ping");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "pong");
    assert_eq!(vm.waiting_reason(agent), Some(WaitReason::Idle));
}

/// Test: the request payload carries model, system prompt, history, and
/// declared tool names
#[test]
fn test_request_payload_shape() {
    let (stub, transport) = shared();
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
    b.begin_function("lookup", 1, 1);
    b.emit(Opcode::LoadLocal(0));
    b.emit(Opcode::Return);
    b.finish_function();
    b.add_agent(AgentDef {
        name: "helper".to_string(),
        model: "vega-small".to_string(),
        system_prompt: "be brief".to_string(),
        temperature: 0.2,
        tools: vec![1],
    });

    let mut vm = Vm::new(b.finish(), transport);
    vm.set_auth(Some("Bearer test-token".to_string()));
    let pid = vm.spawn("main", vec![]).expect("spawn failed");
    while vm.tick() {}
    assert!(matches!(vm.waiting_reason(pid), Some(WaitReason::Reply(_))));

    let stub = stub.borrow();
    let (_, request) = &stub.submitted()[0];
    assert_eq!(request.auth.as_deref(), Some("Bearer test-token"));
    assert_eq!(request.payload["model"], "vega-small");
    assert_eq!(request.payload["system"], "be brief");
    assert_eq!(request.payload["temperature"], 0.2);
    assert_eq!(request.payload["messages"][0]["role"], "user");
    assert_eq!(request.payload["messages"][0]["content"], "ping");
    assert_eq!(request.payload["tools"][0], "lookup");
}

/// Test: a tool request executes the declared function synchronously and
/// resubmits; the final history is user, tool request, tool result,
/// assistant
#[test]
fn test_tool_round_trip() {
    let mut b = ProgramBuilder::new();
    let ping = b.add_constant(Const::Str("ping".to_string()));
    let prefix = b.add_constant(Const::Str("result:".to_string()));
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
        temperature: 0.0,
        tools: vec![1],
    });

    let mut calls = 0;
    let transport = StubTransport::auto(move |_| {
        calls += 1;
        if calls == 1 {
            Ok(LlmResponse::tool("lookup", serde_json::json!(["topic"])))
        } else {
            Ok(LlmResponse::text("found it"))
        }
    });

    let mut vm = Vm::new(b.finish(), Box::new(transport));
    let pid = vm.run("main", vec![]).expect("spawn failed");

    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "found it"),
        other => panic!("expected done, got {other:?}"),
    }

    let agent = vm.process_ids()[0];
    let history = vm.agent_history(agent).expect("agent reaped");
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    let call = history[1].tool_call.as_ref().expect("no tool call");
    assert_eq!(call.name, "lookup");
    assert_eq!(history[2].role, Role::Tool);
    assert_eq!(history[2].content, "result:topic");
    assert_eq!(history[3].role, Role::Assistant);
    assert_eq!(history[3].content, "found it");
}

/// Test: a transport failure fails agent and caller with the same kind
#[test]
fn test_transport_failure_blast_radius() {
    let mut vm = Vm::new(
        send_program(vec![]),
        Box::new(StubTransport::auto(|_| {
            Err(TransportError::Network("connection refused".to_string()))
        })),
    );
    let caller = vm.run("main", vec![]).expect("spawn failed");

    let caller_exit = vm.exit_status(caller).cloned();
    let agent_exit = vm.exit_status(ProcessId(2)).cloned();
    for exit in [caller_exit, agent_exit] {
        match exit {
            Some(ExitStatus::Failed(RuntimeError { kind, .. })) => match kind {
                ErrorKind::Agent { status, message } => {
                    assert_eq!(status, None);
                    assert!(message.contains("connection refused"));
                }
                other => panic!("expected agent error, got {other:?}"),
            },
            other => panic!("expected failure, got {other:?}"),
        }
    }
    assert!(vm.process_ids().is_empty());
}

/// Test: a non-success HTTP status carries the status into the error
#[test]
fn test_http_error_status_preserved() {
    let mut vm = Vm::new(
        send_program(vec![]),
        Box::new(StubTransport::auto(|_| {
            Ok(LlmResponse {
                status: 503,
                body: serde_json::json!({}),
            })
        })),
    );
    let caller = vm.run("main", vec![]).expect("spawn failed");
    match vm.exit_status(caller) {
        Some(ExitStatus::Failed(err)) => {
            assert!(matches!(
                err.kind,
                ErrorKind::Agent {
                    status: Some(503),
                    ..
                }
            ));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

/// Test: a tool the agent did not declare fails the exchange
#[test]
fn test_undeclared_tool_rejected() {
    let mut vm = Vm::new(
        send_program(vec![]),
        Box::new(StubTransport::auto(|_| {
            Ok(LlmResponse::tool("rm_rf", serde_json::json!([])))
        })),
    );
    let caller = vm.run("main", vec![]).expect("spawn failed");
    match vm.exit_status(caller) {
        Some(ExitStatus::Failed(err)) => match &err.kind {
            ErrorKind::Agent { message, .. } => {
                assert!(message.contains("undeclared tool"), "message: {message}");
            }
            other => panic!("expected agent error, got {other:?}"),
        },
        other => panic!("expected failure, got {other:?}"),
    }
}

/// Test: a completion for an unknown handle is discarded silently
#[test]
fn test_dangling_completion_discarded() {
    let (stub, transport) = shared();
    let mut vm = Vm::new(send_program(vec![]), transport);
    let caller = vm.spawn("main", vec![]).expect("spawn failed");

    while vm.tick() {}
    // Suspended pair, one real request in flight.
    assert_eq!(stub.borrow().submitted().len(), 1);

    stub.borrow_mut()
        .resolve(RequestHandle(999), Ok(LlmResponse::text("ghost")));
    vm.tick();
    // Nothing resumed; the caller is still suspended.
    assert!(vm.exit_status(caller).is_none());
    assert!(matches!(
        vm.waiting_reason(caller),
        Some(WaitReason::Reply(_))
    ));

    // The real completion still lands.
    let handle = stub.borrow().submitted()[0].0;
    stub.borrow_mut()
        .resolve(handle, Ok(LlmResponse::text("real")));
    while vm.tick() {}
    match vm.exit_status(caller).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "real"),
        other => panic!("expected done, got {other:?}"),
    }
}

/// Test: only the first completion for a handle is applied
#[test]
fn test_duplicate_completion_applied_once() {
    let (stub, transport) = shared();
    let mut vm = Vm::new(send_program(vec![]), transport);
    let caller = vm.spawn("main", vec![]).expect("spawn failed");

    while vm.tick() {}
    let handle = stub.borrow().submitted()[0].0;
    stub.borrow_mut()
        .resolve(handle, Ok(LlmResponse::text("first")));
    stub.borrow_mut()
        .resolve(handle, Ok(LlmResponse::text("second")));
    while vm.tick() {}

    match vm.exit_status(caller).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "first"),
        other => panic!("expected done, got {other:?}"),
    }
    let agent = vm.process_ids()[0];
    let history = vm.agent_history(agent).expect("agent reaped");
    // One user entry, one assistant entry; the duplicate never landed.
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "first");
}

/// Test: sending to a non-agent value faults the sender
#[test]
fn test_send_to_non_agent_faults() {
    let mut b = ProgramBuilder::new();
    let msg = b.add_constant(Const::Str("hi".to_string()));
    let n = b.add_constant(Const::Int(7));
    b.begin_function("main", 0, 0);
    b.emit(Opcode::PushConst(n));
    b.emit(Opcode::PushConst(msg));
    b.emit(Opcode::AgentSend);
    b.emit(Opcode::Return);
    b.finish_function();

    let mut vm = Vm::new(b.finish(), Box::new(StubTransport::new()));
    let pid = vm.run("main", vec![]).expect("spawn failed");
    assert!(matches!(
        vm.exit_status(pid),
        Some(ExitStatus::Failed(RuntimeError {
            kind: ErrorKind::TypeMismatch(_),
            ..
        }))
    ));
}

/// Transport that answers from a background thread through the
/// completion queue.
struct ThreadedTransport {
    queue: CompletionQueue,
    next_handle: u64,
}

impl ThreadedTransport {
    fn new() -> Self {
        Self {
            queue: CompletionQueue::new(),
            next_handle: 0,
        }
    }
}

impl LlmTransport for ThreadedTransport {
    fn submit(&mut self, _request: LlmRequest) -> RequestHandle {
        let handle = RequestHandle(self.next_handle);
        self.next_handle += 1;
        let sender = self.queue.sender();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            sender.send((handle, Ok(LlmResponse::text("pong"))));
        });
        handle
    }

    fn poll(&mut self) -> Vec<Completion> {
        self.queue.drain()
    }
}

/// Test: a completion delivered from a background thread through the
/// completion queue resumes the suspended caller
#[test]
fn test_background_thread_completion_resumes_caller() {
    let mut vm = Vm::new(send_program(vec![]), Box::new(ThreadedTransport::new()));
    let pid = vm.run("main", vec![]).expect("spawn failed");
    match vm.exit_status(pid).cloned() {
        Some(ExitStatus::Done(v)) => assert_eq!(vm.display(&v), "pong"),
        other => panic!("expected done, got {other:?}"),
    }
}

/// Test: killing an agent mid-flight fails the suspended caller and its
/// late completion dangles
#[test]
fn test_killed_agent_fails_waiting_caller() {
    let (stub, transport) = shared();
    let mut vm = Vm::new(send_program(vec![]), transport);
    let caller = vm.spawn("main", vec![]).expect("spawn failed");

    while vm.tick() {}
    let agent = vm
        .process_ids()
        .into_iter()
        .find(|p| *p != caller)
        .expect("no agent process");
    assert!(vm.kill(agent));

    match vm.exit_status(caller) {
        Some(ExitStatus::Failed(err)) => {
            assert_eq!(err.kind, ErrorKind::UnknownAgent(agent));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // The late reply has nowhere to go and is discarded.
    let handle = stub.borrow().submitted()[0].0;
    stub.borrow_mut()
        .resolve(handle, Ok(LlmResponse::text("too late")));
    vm.tick();
    assert!(vm.process_ids().is_empty());
}

//! The virtual machine: process table, scheduler loop, and the
//! agent-exchange state machine.
//!
//! The VM owns everything: the loaded program, the heap, the global
//! slots, the process table, the scheduler, and the transport. All of it
//! runs on the embedder's thread; the transport's completion queue is
//! the only boundary other threads touch.
//!
//! An agent exchange is driven entirely by the pending-request table.
//! `agent-send` suspends both the caller (waiting for the reply) and the
//! agent (waiting for the backend) under one request handle; the
//! completion for that handle is the only thing that can resume either
//! side. Removing the record on first delivery makes duplicates and
//! dangles harmless by construction.

use crate::dispatch::{self, StepOutcome};
use crate::native::{NativeFn, NativeRegistry};
use crate::process::{Frame, Process, ProcessState};
use crate::scheduler::{Scheduler, WaitReason, DEFAULT_QUOTA};
use agent_runtime::{
    build_request, parse_reply, AgentState, ChatEntry, LlmTransport, Reply, RequestHandle,
    ToolCall,
};
use bytecode_system::{artifact, AgentDef, Const, LoadError, Program};
use core_types::{ErrorKind, ProcessId, RuntimeError, TraceEvent, TraceSink, Value};
use memory_manager::Heap;
use std::collections::HashMap;

/// One in-flight backend request and the processes suspended on it.
///
/// The record is removed when its completion is delivered; a handle with
/// no record is a dangle or a duplicate and is discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Transport handle the completion will arrive under
    pub handle: RequestHandle,
    /// Agent process suspended on this request
    pub agent: ProcessId,
    /// Caller suspended in `agent-send`, if still interested
    pub reply_to: Option<ProcessId>,
}

/// How a terminated process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitStatus {
    /// The outermost frame returned this value
    Done(Value),
    /// The process faulted
    Failed(RuntimeError),
}

/// Snapshot of one call frame, for debug clients.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Name of the executing function
    pub function: String,
    /// Current instruction offset in the code segment
    pub offset: usize,
}

/// Snapshot of one live process, for debug clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    /// Process id
    pub pid: ProcessId,
    /// Scheduling state
    pub state: ProcessState,
    /// True for processes created by `spawn-agent`
    pub is_agent: bool,
    /// Call stack, outermost first
    pub frames: Vec<FrameInfo>,
}

/// The Vega virtual machine.
///
/// # Examples
///
/// ```
/// use agent_runtime::StubTransport;
/// use bytecode_system::{Const, Opcode, ProgramBuilder};
/// use core_types::Value;
/// use interpreter::{ExitStatus, Vm};
///
/// let mut b = ProgramBuilder::new();
/// let forty = b.add_constant(Const::Int(40));
/// let two = b.add_constant(Const::Int(2));
/// b.begin_function("main", 0, 0);
/// b.emit(Opcode::PushConst(forty));
/// b.emit(Opcode::PushConst(two));
/// b.emit(Opcode::Add);
/// b.emit(Opcode::Return);
/// b.finish_function();
///
/// let mut vm = Vm::new(b.finish(), Box::new(StubTransport::new()));
/// let pid = vm.run("main", vec![]).unwrap();
/// assert_eq!(vm.exit_status(pid), Some(&ExitStatus::Done(Value::Int(42))));
/// ```
pub struct Vm {
    program: Program,
    consts: Vec<Value>,
    heap: Heap,
    globals: Vec<Value>,
    processes: HashMap<ProcessId, Process>,
    scheduler: Scheduler,
    pending: HashMap<RequestHandle, PendingRequest>,
    transport: Box<dyn LlmTransport>,
    natives: NativeRegistry,
    trace: Option<Box<dyn TraceSink>>,
    exits: HashMap<ProcessId, ExitStatus>,
    next_pid: u64,
    auth: Option<String>,
    quota: u32,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("processes", &self.processes.len())
            .field("pending", &self.pending.len())
            .field("live_objects", &self.heap.live_objects())
            .finish()
    }
}

impl Vm {
    /// Creates a VM over a loaded program.
    ///
    /// String constants are interned onto the heap once; the intern table
    /// holds one count per entry for the VM's lifetime.
    pub fn new(program: Program, transport: Box<dyn LlmTransport>) -> Self {
        let mut heap = Heap::new();
        let consts = program
            .constants
            .iter()
            .map(|c| match c {
                Const::Null => Value::Null,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(i) => Value::Int(*i),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => heap.alloc_str(s.clone()),
            })
            .collect();
        Self {
            program,
            consts,
            heap,
            globals: Vec::new(),
            processes: HashMap::new(),
            scheduler: Scheduler::new(),
            pending: HashMap::new(),
            transport,
            natives: NativeRegistry::new(),
            trace: None,
            exits: HashMap::new(),
            next_pid: 1,
            auth: None,
            quota: DEFAULT_QUOTA,
        }
    }

    /// Loads a binary artifact and creates a VM over it.
    pub fn from_artifact(bytes: &[u8], transport: Box<dyn LlmTransport>) -> Result<Self, LoadError> {
        Ok(Self::new(artifact::load(bytes)?, transport))
    }

    /// Registers a native capability under `id`.
    pub fn register_native(&mut self, id: u16, name: &str, arity: u8, func: NativeFn) {
        self.natives.register(id, name, arity, func);
    }

    /// Attaches a trace sink. Events start flowing immediately.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = Some(sink);
    }

    /// Overrides the per-turn instruction quota.
    pub fn set_quota(&mut self, quota: u32) {
        self.quota = quota.max(1);
    }

    /// Sets the authorization header value sent with backend requests.
    pub fn set_auth(&mut self, auth: Option<String>) {
        self.auth = auth;
    }

    /// The heap, for inspecting values and leak checks.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access, for building argument values.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Renders a value for display.
    pub fn display(&self, value: &Value) -> String {
        self.heap.display(value)
    }

    fn emit(&mut self, event: TraceEvent) {
        if let Some(sink) = self.trace.as_mut() {
            sink.record(&event);
        }
    }

    fn fresh_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Spawns a process running the named function and enqueues it Ready.
    ///
    /// Ownership of `args` transfers to the new process's locals.
    pub fn spawn(&mut self, name: &str, args: Vec<Value>) -> Result<ProcessId, ErrorKind> {
        let fidx = match self.program.function_named(name) {
            Some(i) => i,
            None => {
                for v in args {
                    self.heap.release(v);
                }
                return Err(ErrorKind::UnknownFunction(format!("'{name}'")));
            }
        };
        let fdef = &self.program.functions[fidx];
        if usize::from(fdef.arity) != args.len() {
            let e = ErrorKind::ArityMismatch {
                callee: fdef.name.clone(),
                expected: fdef.arity,
                got: u8::try_from(args.len()).unwrap_or(u8::MAX),
            };
            for v in args {
                self.heap.release(v);
            }
            return Err(e);
        }
        let frame = Frame::new(fidx, fdef.code_offset, fdef.locals, args);
        let pid = self.fresh_pid();
        self.processes.insert(pid, Process::new(pid, frame));
        self.scheduler.enqueue(pid);
        self.emit(TraceEvent::ProcessCreated(pid));
        Ok(pid)
    }

    /// Creates a passive agent process bound to the agent table entry.
    /// It holds conversation state and only executes bytecode when the
    /// backend requests a tool.
    fn create_agent(&mut self, def: u16) -> ProcessId {
        let pid = self.fresh_pid();
        let mut proc = Process::new_agent(pid, AgentState::new(usize::from(def)));
        proc.state = ProcessState::Waiting;
        self.processes.insert(pid, proc);
        self.scheduler.park(pid, WaitReason::Idle);
        self.emit(TraceEvent::ProcessCreated(pid));
        pid
    }

    /// Runs the named function in batch mode: spawns it and drives the
    /// scheduler until that process terminates.
    ///
    /// While any request is in flight the transport keeps being polled,
    /// however late its completions arrive; other processes still waiting
    /// when the spawned process exits stay parked.
    pub fn run(&mut self, name: &str, args: Vec<Value>) -> Result<ProcessId, ErrorKind> {
        let pid = self.spawn(name, args)?;
        while !self.exits.contains_key(&pid) {
            if !self.tick() {
                if self.pending.is_empty() {
                    break;
                }
                std::thread::yield_now();
            }
        }
        Ok(pid)
    }

    /// Drives the scheduler until the engine is quiescent: no process is
    /// ready and every waiter is an idle agent. Requests in flight are
    /// polled until their completions arrive.
    pub fn run_until_quiescent(&mut self) {
        loop {
            let progressed = self.tick();
            if self.scheduler.is_quiescent() && self.pending.is_empty() {
                return;
            }
            if !progressed {
                if self.pending.is_empty() {
                    return;
                }
                std::thread::yield_now();
            }
        }
    }

    /// Executes one scheduler turn: polls completions, then runs the next
    /// ready process for up to one quota. Returns whether anything
    /// happened.
    pub fn tick(&mut self) -> bool {
        let mut progressed = self.poll_completions() > 0;
        let pid = loop {
            match self.scheduler.next() {
                Some(p) => {
                    // Stale queue entries (parked or reaped since) are skipped.
                    if self
                        .processes
                        .get(&p)
                        .is_some_and(|pr| pr.state == ProcessState::Ready)
                    {
                        break Some(p);
                    }
                }
                None => break None,
            }
        };
        if let Some(pid) = pid {
            self.run_turn(pid, self.quota);
            progressed = true;
        }
        progressed
    }

    /// Runs exactly one instruction of `pid`, putting it back at the
    /// queue head so repeated calls walk it forward. Debug hook.
    pub fn step_process(&mut self, pid: ProcessId) -> bool {
        self.poll_completions();
        if !self
            .processes
            .get(&pid)
            .is_some_and(|p| p.state == ProcessState::Ready)
        {
            return false;
        }
        self.scheduler.unqueue(pid);
        self.run_turn(pid, 1);
        if self
            .processes
            .get(&pid)
            .is_some_and(|p| p.state == ProcessState::Ready)
        {
            self.scheduler.unqueue(pid);
            self.scheduler.enqueue_front(pid);
        }
        true
    }

    /// Forcibly terminates a process, failing any exchange it was part
    /// of. Returns false if the pid is not live.
    pub fn kill(&mut self, pid: ProcessId) -> bool {
        let Some(proc) = self.processes.remove(&pid) else {
            return false;
        };
        // An agent with a request in flight: its completion becomes a
        // dangle, and the suspended caller learns the agent is gone.
        if let Some(handle) = proc.agent.as_ref().and_then(|a| a.pending) {
            if let Some(req) = self.pending.remove(&handle) {
                self.fail_caller(req.reply_to, ErrorKind::UnknownAgent(pid));
            }
        }
        // A caller suspended in agent-send: detach it so the eventual
        // reply is not delivered to a reaped process.
        if let Some(WaitReason::Reply(handle)) = self.scheduler.waiting_reason(pid) {
            if let Some(req) = self.pending.get_mut(&handle) {
                req.reply_to = None;
            }
        }
        let offset = proc.current_offset();
        self.reap(
            proc,
            ExitStatus::Failed(RuntimeError {
                pid,
                offset,
                kind: ErrorKind::Internal("killed".to_string()),
            }),
        );
        true
    }

    fn run_turn(&mut self, pid: ProcessId, quota: u32) {
        let Some(mut proc) = self.processes.remove(&pid) else {
            return;
        };
        if proc.frames.is_empty() {
            // A frameless agent has nothing to execute.
            proc.state = ProcessState::Waiting;
            self.scheduler.park(pid, WaitReason::Idle);
            self.processes.insert(pid, proc);
            return;
        }
        proc.state = ProcessState::Running;
        for _ in 0..quota {
            let at = proc.current_offset();
            match dispatch::step(
                &mut proc,
                &self.program,
                &self.consts,
                &mut self.heap,
                &self.natives,
                &mut self.globals,
            ) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Terminated(value)) => {
                    self.reap(proc, ExitStatus::Done(value));
                    return;
                }
                Ok(StepOutcome::SpawnAgent { def }) => {
                    let agent = self.create_agent(def);
                    if let Err(v) = proc.push_value(Value::Agent(agent)) {
                        self.heap.release(v);
                    }
                }
                Ok(StepOutcome::AgentSend { agent, message }) => {
                    match self.begin_exchange(pid, agent, message) {
                        Ok(handle) => {
                            proc.state = ProcessState::Waiting;
                            self.scheduler.park(pid, WaitReason::Reply(handle));
                            self.emit(TraceEvent::ProcessSuspended(pid));
                            self.processes.insert(pid, proc);
                        }
                        Err(kind) => {
                            self.reap(
                                proc,
                                ExitStatus::Failed(RuntimeError {
                                    pid,
                                    offset: at,
                                    kind,
                                }),
                            );
                        }
                    }
                    return;
                }
                Err(err) => {
                    self.reap(proc, ExitStatus::Failed(err));
                    return;
                }
            }
        }
        // Quota exhausted; rotate to the queue tail.
        proc.state = ProcessState::Ready;
        self.scheduler.enqueue(pid);
        self.processes.insert(pid, proc);
    }

    /// Suspends the caller-side of `agent-send` and submits the request.
    fn begin_exchange(
        &mut self,
        caller: ProcessId,
        agent: ProcessId,
        message: String,
    ) -> Result<RequestHandle, ErrorKind> {
        let proc = self
            .processes
            .get_mut(&agent)
            .filter(|p| p.is_agent())
            .ok_or(ErrorKind::UnknownAgent(agent))?;
        let Some(state) = proc.agent.as_mut() else {
            return Err(ErrorKind::UnknownAgent(agent));
        };
        if state.pending.is_some() {
            return Err(ErrorKind::Agent {
                status: None,
                message: format!("agent {agent} already has a request in flight"),
            });
        }
        state.push_user(message);
        let def = &self.program.agents[state.def];
        let names = tool_names(&self.program, def);
        let request = build_request(def, &state.history, &names, self.auth.clone());
        let handle = self.transport.submit(request);
        state.pending = Some(handle);
        proc.state = ProcessState::Waiting;
        self.pending.insert(
            handle,
            PendingRequest {
                handle,
                agent,
                reply_to: Some(caller),
            },
        );
        self.scheduler.park(agent, WaitReason::Request(handle));
        self.emit(TraceEvent::AgentSent(agent));
        Ok(handle)
    }

    /// Drains the transport and applies each completion. Returns how many
    /// arrived.
    fn poll_completions(&mut self) -> usize {
        let completions = self.transport.poll();
        let count = completions.len();
        for (handle, result) in completions {
            // No record: dangling or duplicate. Discard.
            let Some(req) = self.pending.remove(&handle) else {
                continue;
            };
            if !self.processes.contains_key(&req.agent) {
                self.fail_caller(req.reply_to, ErrorKind::UnknownAgent(req.agent));
                continue;
            }
            match result {
                Ok(response) => match parse_reply(&response) {
                    Ok(Reply::Text(text)) => self.finish_exchange(req, text),
                    Ok(Reply::Tool(call)) => self.handle_tool(req, call),
                    Err(kind) => self.fail_exchange(req, kind),
                },
                Err(transport_err) => self.fail_exchange(req, transport_err.into()),
            }
        }
        count
    }

    /// Applies a final text reply: records it in the history, returns the
    /// agent to idle, and resumes the caller with the reply value.
    fn finish_exchange(&mut self, req: PendingRequest, text: String) {
        if let Some(proc) = self.processes.get_mut(&req.agent) {
            if let Some(state) = proc.agent.as_mut() {
                state.push_assistant(text.as_str());
                state.pending = None;
            }
        }
        self.scheduler.park(req.agent, WaitReason::Idle);
        self.emit(TraceEvent::AgentReceived(req.agent));

        let Some(caller) = req.reply_to else { return };
        let value = self.heap.alloc_str(text);
        match self.processes.get_mut(&caller) {
            Some(proc) => {
                if let Err(v) = proc.push_value(value) {
                    self.heap.release(v);
                }
                proc.state = ProcessState::Ready;
                self.scheduler.resume(caller);
                self.emit(TraceEvent::ProcessResumed(caller));
            }
            None => self.heap.release(value),
        }
    }

    /// Applies a tool request: executes the named function synchronously
    /// on the agent process, then resubmits with the result appended.
    fn handle_tool(&mut self, req: PendingRequest, call: ToolCall) {
        let Some(mut proc) = self.processes.remove(&req.agent) else {
            return;
        };
        self.emit(TraceEvent::AgentReceived(req.agent));
        match self.run_tool(&mut proc, &call) {
            Ok(text) => {
                let Some(state) = proc.agent.as_mut() else {
                    self.processes.insert(req.agent, proc);
                    return;
                };
                state.push_tool_result(text.as_str());
                let def = &self.program.agents[state.def];
                let names = tool_names(&self.program, def);
                let request = build_request(def, &state.history, &names, self.auth.clone());
                let handle = self.transport.submit(request);
                state.pending = Some(handle);
                self.pending.insert(
                    handle,
                    PendingRequest {
                        handle,
                        agent: req.agent,
                        reply_to: req.reply_to,
                    },
                );
                self.scheduler.park(req.agent, WaitReason::Request(handle));
                self.emit(TraceEvent::AgentSent(req.agent));
                self.processes.insert(req.agent, proc);
            }
            Err(kind) => {
                let offset = proc.current_offset();
                self.reap(
                    proc,
                    ExitStatus::Failed(RuntimeError {
                        pid: req.agent,
                        offset,
                        kind: kind.clone(),
                    }),
                );
                self.fail_caller(req.reply_to, kind);
            }
        }
    }

    /// Runs one declared tool to completion on the agent process and
    /// renders its return value.
    fn run_tool(&mut self, proc: &mut Process, call: &ToolCall) -> Result<String, ErrorKind> {
        let Some(state) = proc.agent.as_mut() else {
            return Err(ErrorKind::Internal(
                "tool request for a non-agent process".to_string(),
            ));
        };
        let def = &self.program.agents[state.def];
        let fidx = self
            .program
            .function_named(&call.name)
            .filter(|i| def.tools.iter().any(|t| usize::from(*t) == *i))
            .ok_or_else(|| ErrorKind::Agent {
                status: None,
                message: format!("agent requested undeclared tool '{}'", call.name),
            })?;
        state.push_tool_request(call.clone());
        let fdef = &self.program.functions[fidx];
        let args_json = call.arguments.as_array().ok_or_else(|| ErrorKind::Agent {
            status: None,
            message: "tool arguments must be an array".to_string(),
        })?;
        if args_json.len() != usize::from(fdef.arity) {
            return Err(ErrorKind::ArityMismatch {
                callee: fdef.name.clone(),
                expected: fdef.arity,
                got: u8::try_from(args_json.len()).unwrap_or(u8::MAX),
            });
        }
        let args: Vec<Value> = args_json
            .iter()
            .map(|j| json_to_value(&mut self.heap, j))
            .collect();
        proc.frames
            .push(Frame::new(fidx, fdef.code_offset, fdef.locals, args));
        loop {
            match dispatch::step(
                proc,
                &self.program,
                &self.consts,
                &mut self.heap,
                &self.natives,
                &mut self.globals,
            ) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Terminated(value)) => {
                    let text = self.heap.display(&value);
                    self.heap.release(value);
                    return Ok(text);
                }
                Ok(StepOutcome::SpawnAgent { def }) => {
                    let agent = self.create_agent(def);
                    if let Err(v) = proc.push_value(Value::Agent(agent)) {
                        self.heap.release(v);
                    }
                }
                Ok(StepOutcome::AgentSend { .. }) => {
                    return Err(ErrorKind::Agent {
                        status: None,
                        message: "agent-send is not allowed inside a tool call".to_string(),
                    });
                }
                Err(err) => return Err(err.kind),
            }
        }
    }

    /// Fails both sides of an exchange with the same fault kind.
    fn fail_exchange(&mut self, req: PendingRequest, kind: ErrorKind) {
        if let Some(proc) = self.processes.remove(&req.agent) {
            let offset = proc.current_offset();
            self.reap(
                proc,
                ExitStatus::Failed(RuntimeError {
                    pid: req.agent,
                    offset,
                    kind: kind.clone(),
                }),
            );
        }
        self.fail_caller(req.reply_to, kind);
    }

    fn fail_caller(&mut self, reply_to: Option<ProcessId>, kind: ErrorKind) {
        let Some(caller) = reply_to else { return };
        let Some(proc) = self.processes.remove(&caller) else {
            return;
        };
        let offset = proc.current_offset();
        self.reap(
            proc,
            ExitStatus::Failed(RuntimeError {
                pid: caller,
                offset,
                kind,
            }),
        );
    }

    /// Releases everything a terminated process held and records its exit.
    fn reap(&mut self, mut proc: Process, status: ExitStatus) {
        let pid = proc.id;
        let failed = matches!(status, ExitStatus::Failed(_));
        for v in proc.drain_values() {
            self.heap.release(v);
        }
        self.scheduler.remove(pid);
        self.exits.insert(pid, status);
        self.emit(TraceEvent::ProcessTerminated { pid, failed });
    }

    /// Ids of all live processes, ascending.
    pub fn process_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshot of one live process.
    pub fn process_info(&self, pid: ProcessId) -> Option<ProcessInfo> {
        let proc = self.processes.get(&pid)?;
        let frames = proc
            .frames
            .iter()
            .map(|f| FrameInfo {
                function: self
                    .program
                    .functions
                    .get(f.function)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| format!("fn@{}", f.function)),
                offset: f.pc,
            })
            .collect();
        Some(ProcessInfo {
            pid,
            state: proc.state,
            is_agent: proc.is_agent(),
            frames,
        })
    }

    /// Conversation history of a live agent process.
    pub fn agent_history(&self, pid: ProcessId) -> Option<&[ChatEntry]> {
        self.processes
            .get(&pid)
            .and_then(|p| p.agent.as_ref())
            .map(|a| a.history.as_slice())
    }

    /// Why `pid` is suspended, if it is.
    pub fn waiting_reason(&self, pid: ProcessId) -> Option<WaitReason> {
        self.scheduler.waiting_reason(pid)
    }

    /// Exit record of a terminated process.
    pub fn exit_status(&self, pid: ProcessId) -> Option<&ExitStatus> {
        self.exits.get(&pid)
    }
}

fn tool_names(program: &Program, def: &AgentDef) -> Vec<String> {
    def.tools
        .iter()
        .filter_map(|t| program.functions.get(usize::from(*t)).map(|f| f.name.clone()))
        .collect()
}

/// Converts backend-supplied JSON into a runtime value, allocating heap
/// storage as needed.
fn json_to_value(heap: &mut Heap, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => heap.alloc_str(s.clone()),
        serde_json::Value::Array(items) => {
            let values = items.iter().map(|j| json_to_value(heap, j)).collect();
            heap.alloc_array(values)
        }
        serde_json::Value::Object(map) => {
            let fields = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(heap, v)))
                .collect();
            heap.alloc_object(fields)
        }
    }
}

//! Cooperative FIFO scheduler with an instruction quota.
//!
//! Single-threaded by construction: at most one process executes at a
//! time, so no value or heap state is ever shared between concurrently
//! running code. Fairness comes from the quota: a process that neither
//! returns nor suspends within its turn is re-enqueued at the tail.
//!
//! Parking does not remove a pid from the ready queue; the run loop
//! discards popped entries whose process is no longer `Ready`.

use agent_runtime::RequestHandle;
use core_types::ProcessId;
use std::collections::{HashMap, VecDeque};

/// Instructions a process may execute per turn before being rotated out.
pub const DEFAULT_QUOTA: u32 = 256;

/// Why a waiting process is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// An agent process waiting on its own in-flight backend request
    Request(RequestHandle),
    /// A caller suspended in `agent-send`, waiting for the reply to the
    /// given request
    Reply(RequestHandle),
    /// An agent process with nothing to do; ignored for quiescence
    Idle,
}

/// Ready queue and waiting set.
///
/// # Examples
///
/// ```
/// use interpreter::{Scheduler, WaitReason};
/// use core_types::ProcessId;
///
/// let mut s = Scheduler::new();
/// s.enqueue(ProcessId(1));
/// s.enqueue(ProcessId(2));
/// assert_eq!(s.next(), Some(ProcessId(1)));
/// s.park(ProcessId(2), WaitReason::Idle);
/// assert!(s.is_quiescent());
/// ```
#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<ProcessId>,
    waiting: HashMap<ProcessId, WaitReason>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a process to the ready queue tail.
    pub fn enqueue(&mut self, pid: ProcessId) {
        self.ready.push_back(pid);
    }

    /// Puts a process at the ready queue head, ahead of everything else.
    /// Used by single-step debugging.
    pub fn enqueue_front(&mut self, pid: ProcessId) {
        self.ready.push_front(pid);
    }

    /// Pops the next queued pid, oldest first.
    pub fn next(&mut self) -> Option<ProcessId> {
        self.ready.pop_front()
    }

    /// Records a process as waiting. The pid stays in the ready queue if
    /// already there; the run loop skips stale entries.
    pub fn park(&mut self, pid: ProcessId, reason: WaitReason) {
        self.waiting.insert(pid, reason);
    }

    /// Promotes a waiting process back to Ready, enqueuing it at the
    /// tail. No-op if the process was not waiting.
    pub fn resume(&mut self, pid: ProcessId) {
        if self.waiting.remove(&pid).is_some() {
            self.ready.push_back(pid);
        }
    }

    /// Forgets a process entirely (reap path).
    pub fn remove(&mut self, pid: ProcessId) {
        self.waiting.remove(&pid);
        self.ready.retain(|p| *p != pid);
    }

    /// Removes a pid's queued entries without touching its waiting
    /// record. Used before a forced single-step.
    pub fn unqueue(&mut self, pid: ProcessId) {
        self.ready.retain(|p| *p != pid);
    }

    /// Why `pid` is waiting, if it is.
    pub fn waiting_reason(&self, pid: ProcessId) -> Option<WaitReason> {
        self.waiting.get(&pid).copied()
    }

    /// Number of queued entries (stale ones included).
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// True when no process is queued and every waiting process is idle.
    ///
    /// An idle agent is not progress waiting to happen: with an empty
    /// queue and only idle waiters, no future completion can arrive, so
    /// the engine may stop.
    pub fn is_quiescent(&self) -> bool {
        self.ready.is_empty() && self.waiting.values().all(|r| matches!(r, WaitReason::Idle))
    }
}

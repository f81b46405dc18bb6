//! Thread-safe completion queue.
//!
//! This is the single location in the engine that needs genuine thread
//! safety: a transport doing network I/O on background threads enqueues
//! completions here, and the scheduler drains them from its own thread
//! during the non-blocking poll. Nothing else crosses threads.

use crate::transport::Completion;
use crossbeam::channel::{unbounded, Receiver, Sender};

/// Cloneable sending half handed to background transport threads.
///
/// Sending never blocks; if the queue's receiving half is gone the
/// completion is dropped, which is exactly the dangling-completion rule.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<Completion>,
}

impl CompletionSender {
    /// Enqueues one completion.
    pub fn send(&self, completion: Completion) {
        let _ = self.tx.send(completion);
    }
}

/// The scheduler-side completion queue.
///
/// # Examples
///
/// ```
/// use agent_runtime::{CompletionQueue, LlmResponse, RequestHandle};
///
/// let queue = CompletionQueue::new();
/// let sender = queue.sender();
///
/// std::thread::spawn(move || {
///     sender.send((RequestHandle(0), Ok(LlmResponse::text("done"))));
/// })
/// .join()
/// .unwrap();
///
/// assert_eq!(queue.drain().len(), 1);
/// ```
#[derive(Debug)]
pub struct CompletionQueue {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl CompletionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Returns a sender for background threads.
    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    /// Drains every completion that arrived since the last drain, in
    /// arrival order. Never blocks.
    pub fn drain(&self) -> Vec<Completion> {
        self.rx.try_iter().collect()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

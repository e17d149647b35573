//! The single-threaded dispatch queue that deferred actions run on.
//!
//! Tasks may be posted from any thread; they are executed strictly in
//! posting order by whichever single thread the owner drives `try_tick`
//! from. The queue never runs tasks concurrently with each other — it is
//! the sole serialization point for everything the stream owner does.

use std::thread::{self, ThreadId};

use concurrent_queue::ConcurrentQueue;
use parking_lot::Mutex;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The interface a completion tag needs from its dispatch queue: post a task
/// for later serialized execution, and tell whether the calling thread is the
/// one currently draining the queue (used by debug assertions guarding the
/// tag's threading preconditions).
pub trait Dispatch: Send + Sync {
    /// Post a task for later serialized execution. Must not block.
    fn post(&self, task: Task);

    /// Whether the calling thread is currently executing a task from this
    /// queue.
    fn is_current_thread(&self) -> bool;
}

/// A cooperative serialized executor.
///
/// Posting is safe from any thread; draining is meant to be done by one
/// thread at a time via [`try_tick`](DispatchQueue::try_tick) or
/// [`run_until_idle`](DispatchQueue::run_until_idle). Tasks left in the
/// queue when it is dropped are discarded without running.
pub struct DispatchQueue {
    /// Ready queue: tasks in posting order.
    queue: ConcurrentQueue<Task>,
    /// Thread currently inside `try_tick`, if any.
    draining: Mutex<Option<ThreadId>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        DispatchQueue {
            queue: ConcurrentQueue::unbounded(),
            draining: Mutex::new(None),
        }
    }

    /// Pop one task and run it. Returns true if a task was executed.
    pub fn try_tick(&self) -> bool {
        match self.queue.pop() {
            Ok(task) => {
                *self.draining.lock() = Some(thread::current().id());
                task();
                *self.draining.lock() = None;
                true
            }
            Err(_) => false,
        }
    }

    /// Run tasks until the queue is empty. Returns how many tasks ran,
    /// counting any that were posted while draining.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.try_tick() {
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for DispatchQueue {
    fn post(&self, task: Task) {
        // The queue is unbounded and never closed, so push cannot fail.
        let _ = self.queue.push(task);
    }

    fn is_current_thread(&self) -> bool {
        *self.draining.lock() == Some(thread::current().id())
    }
}

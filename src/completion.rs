//! The completion tag: a self-owned handle for one in-flight transport
//! operation.
//!
//! A tag is created by the stream owner, handed to the transport's
//! completion queue alongside an enqueued operation (connect, read, write,
//! finish), and eventually returned by the transport's background poller
//! with a success flag. At that point [`Completion::complete`] runs: it
//! unblocks anyone waiting for the tag to come off the transport queue,
//! then posts the tag's action onto the dispatch queue — unless the owner
//! cancelled it first.
//!
//! The transport side holds the tag as `Box<Completion>` and `complete`
//! consumes it, so the tag is freed exactly once no matter how the
//! cancellation race goes. The stream owner keeps only a
//! [`CompletionHandle`] for cancellation and the off-queue rendezvous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

use crate::dispatch::Dispatch;
use crate::status::Status;

/// The callback that reacts to a completed operation. Runs on the dispatch
/// queue, never on the transport's poller thread. Receives the success flag
/// and the tag itself, for reading the output buffer/status slots.
pub type Action = Box<dyn FnOnce(bool, &Completion) + Send + 'static>;

/// Result of a timed [`CompletionHandle::wait_until_off_queue_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// `complete` has begun running for this tag.
    Ready,
    /// The timeout elapsed before `complete` was invoked.
    TimedOut,
}

/// One-shot signal: fulfilled exactly once, waitable from any thread.
struct OffQueueSignal {
    fulfilled: Mutex<bool>,
    cond: Condvar,
}

impl OffQueueSignal {
    fn new() -> Self {
        OffQueueSignal {
            fulfilled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.fulfilled.lock() = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.fulfilled.lock()
    }

    fn wait(&self) {
        let mut fulfilled = self.fulfilled.lock();
        while !*fulfilled {
            self.cond.wait(&mut fulfilled);
        }
    }

    fn wait_for(&self, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        let mut fulfilled = self.fulfilled.lock();
        while !*fulfilled {
            if self.cond.wait_until(&mut fulfilled, deadline).timed_out() {
                return if *fulfilled {
                    WaitStatus::Ready
                } else {
                    WaitStatus::TimedOut
                };
            }
        }
        WaitStatus::Ready
    }
}

/// State reachable from both the tag (transport side) and the handle
/// (stream-owner side).
struct Shared {
    queue: Arc<dyn Dispatch>,
    /// One-way transition, written by `cancel`, read once by `complete`
    /// before the dispatch decision.
    cancelled: AtomicBool,
    off_queue: OffQueueSignal,
}

/// A completion tag for one asynchronous transport operation.
///
/// Owns the output slots the transport writes into: a byte buffer for a
/// read operation and a [`Status`] for a finish operation. Either or both
/// may go unused; they are valid to read only from within the deferred
/// action, and only for the operation that populates them.
///
/// All transport objects pertaining to the current stream must remain valid
/// until the tag comes back from the transport queue — that is what the
/// handle's off-queue waits exist for.
pub struct Completion {
    shared: Arc<Shared>,
    /// Taken when the deferred task runs; `None` only at that point.
    action: Option<Action>,
    buffer: BytesMut,
    status: Status,
}

impl Completion {
    /// Create a tag bound to `queue` with the given action.
    ///
    /// Returns the tag itself, to hand to the transport, and the handle the
    /// stream owner keeps for cancellation and teardown waits. The queue
    /// must outlive every task posted onto it by this tag.
    pub fn new<F>(queue: Arc<dyn Dispatch>, action: F) -> (Box<Completion>, CompletionHandle)
    where
        F: FnOnce(bool, &Completion) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            queue,
            cancelled: AtomicBool::new(false),
            off_queue: OffQueueSignal::new(),
        });
        let tag = Box::new(Completion {
            shared: shared.clone(),
            action: Some(Box::new(action)),
            buffer: BytesMut::new(),
            status: Status::ok(),
        });
        (tag, CompletionHandle { shared })
    }

    /// Mark the tag as having come back from the transport queue and hand
    /// the deferred action to the dispatch queue.
    ///
    /// Two-phase protocol:
    ///
    /// 1. Fulfill the off-queue signal, cancelled or not, so teardown
    ///    waiters unblock before anything else happens.
    /// 2. Unless the owner already cancelled, post a task that invokes the
    ///    action with `ok` and a reference to this tag. The tag moves into
    ///    the task and is dropped after the action returns; when cancelled,
    ///    it is dropped right here instead.
    ///
    /// Never blocks. Must be called exactly once, only after the transport
    /// returned this tag, and never from the dispatch queue's own execution
    /// thread — a wait against this tag could otherwise self-deadlock.
    pub fn complete(self: Box<Self>, ok: bool) {
        debug_assert!(
            !self.shared.queue.is_current_thread(),
            "Completion::complete must not be called on the dispatch queue thread"
        );

        self.shared.off_queue.set();

        if self.shared.cancelled.load(Ordering::Acquire) {
            log::trace!("completion cancelled before dispatch, dropping tag (ok={ok})");
            return;
        }

        log::trace!("completion off transport queue, dispatching action (ok={ok})");
        let shared = Arc::clone(&self.shared);
        shared.queue.post(Box::new(move || {
            let mut tag = self;
            if let Some(action) = tag.action.take() {
                action(ok, &tag);
            }
        }));
    }

    /// The read-operation output slot. Written by the transport while it
    /// holds the tag; read back inside the action.
    pub fn buffer(&self) -> &BytesMut {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// The finish-operation output slot.
    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }
}

/// The stream owner's view of an outstanding tag.
///
/// Cancellation and the off-queue rendezvous live here because the tag
/// itself is in the transport's hands from enqueue until `complete`.
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

impl CompletionHandle {
    /// Suppress the deferred action if it has not been scheduled yet.
    ///
    /// Never blocks and never frees the tag — the transport will still
    /// return it and `complete` will still fulfill the off-queue signal.
    /// If `complete` already passed its dispatch decision, the cancellation
    /// is lost silently.
    pub fn cancel(&self) {
        log::trace!("completion cancelled");
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Whether `complete` has begun running for this tag.
    pub fn is_off_queue(&self) -> bool {
        self.shared.off_queue.is_set()
    }

    /// Block until `complete` has begun running for this tag.
    ///
    /// Used during stream teardown to guarantee the transport no longer
    /// references shared stream state before that state is freed. Only call
    /// this when the tag is sure to come off the transport queue quickly,
    /// and never from the dispatch queue's own execution thread.
    pub fn wait_until_off_queue(&self) {
        debug_assert!(
            !self.shared.queue.is_current_thread(),
            "wait_until_off_queue must not be called on the dispatch queue thread"
        );
        self.shared.off_queue.wait();
    }

    /// Like [`wait_until_off_queue`](Self::wait_until_off_queue), but gives
    /// up after `timeout`. A timeout affects only how long this caller
    /// waits; the tag's own lifecycle is untouched.
    pub fn wait_until_off_queue_for(&self, timeout: Duration) -> WaitStatus {
        debug_assert!(
            !self.shared.queue.is_current_thread(),
            "wait_until_off_queue_for must not be called on the dispatch queue thread"
        );
        self.shared.off_queue.wait_for(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchQueue;
    use crate::status::StatusCode;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn new_queue() -> Arc<DispatchQueue> {
        Arc::new(DispatchQueue::new())
    }

    #[test]
    fn action_runs_on_dispatch_queue_with_buffer_intact() {
        let queue = new_queue();
        let recorded: Arc<Mutex<Option<(bool, Vec<u8>)>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();

        let (tag, handle) = Completion::new(queue.clone(), move |ok, tag: &Completion| {
            *recorded_clone.lock() = Some((ok, tag.buffer().to_vec()));
        });

        // Transport side: write the read output, then return the tag.
        let transport = thread::spawn(move || {
            let mut tag = tag;
            tag.buffer_mut().extend_from_slice(b"payload");
            tag.complete(true);
        });
        transport.join().unwrap();

        handle.wait_until_off_queue();
        // Not inline on the completing thread — only when the queue drains.
        assert!(recorded.lock().is_none());
        assert_eq!(queue.run_until_idle(), 1);
        assert_eq!(*recorded.lock(), Some((true, b"payload".to_vec())));
    }

    #[test]
    fn action_sees_status_written_by_transport() {
        let queue = new_queue();
        let recorded: Arc<Mutex<Option<(bool, Status)>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();

        let (mut tag, _handle) = Completion::new(queue.clone(), move |ok, tag: &Completion| {
            *recorded_clone.lock() = Some((ok, tag.status().clone()));
        });

        *tag.status_mut() = Status::new(StatusCode::Unavailable, "connection reset");
        tag.complete(false);
        queue.run_until_idle();

        let (ok, status) = recorded.lock().take().unwrap();
        assert!(!ok);
        assert_eq!(status.code(), StatusCode::Unavailable);
        assert_eq!(status.message(), "connection reset");
    }

    #[test]
    fn cancel_then_complete_suppresses_action_but_fulfills_signal() {
        let queue = new_queue();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let (tag, handle) = Completion::new(queue.clone(), move |_, _: &Completion| {
            ran_clone.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        tag.complete(true);

        // Signal is fulfilled regardless of cancellation.
        assert_eq!(
            handle.wait_until_off_queue_for(Duration::from_secs(1)),
            WaitStatus::Ready
        );
        // Nothing was posted; the action never runs.
        assert_eq!(queue.run_until_idle(), 0);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_tag_is_still_freed() {
        struct DropProbe(Arc<AtomicBool>);
        impl Drop for DropProbe {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let queue = new_queue();
        let dropped = Arc::new(AtomicBool::new(false));
        let probe = DropProbe(dropped.clone());

        let (tag, handle) = Completion::new(queue.clone(), move |_, _: &Completion| {
            let _probe = &probe;
            unreachable!("action must not run after cancel");
        });

        handle.cancel();
        tag.complete(false);

        // The tag (and the action it owned) was dropped inline.
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(queue.run_until_idle(), 0);
    }

    #[test]
    fn timed_wait_times_out_until_complete_runs() {
        let queue = new_queue();
        let (tag, handle) = Completion::new(queue.clone(), |_, _: &Completion| {});

        assert!(!handle.is_off_queue());
        assert_eq!(
            handle.wait_until_off_queue_for(Duration::from_millis(50)),
            WaitStatus::TimedOut
        );

        tag.complete(true);

        assert!(handle.is_off_queue());
        assert_eq!(
            handle.wait_until_off_queue_for(Duration::from_millis(50)),
            WaitStatus::Ready
        );
        queue.run_until_idle();
    }

    #[test]
    fn waiter_unblocks_only_after_complete_begins() {
        let queue = new_queue();
        let (tag, handle) = Completion::new(queue.clone(), |_, _: &Completion| {});
        let handle = Arc::new(handle);

        let completing = Arc::new(AtomicBool::new(false));
        let completing_clone = completing.clone();

        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || {
                handle.wait_until_off_queue();
                // complete must have started by the time we unblock.
                assert!(completing_clone.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(100));
        completing.store(true, Ordering::SeqCst);
        tag.complete(false);

        waiter.join().unwrap();
        queue.run_until_idle();
    }

    #[test]
    fn stress_many_tags_half_cancelled() {
        let queue = new_queue();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut tags = Vec::with_capacity(10_000);
        let mut handles = Vec::with_capacity(10_000);
        for i in 0..10_000 {
            let ran = ran.clone();
            let (tag, handle) = Completion::new(queue.clone(), move |ok, _: &Completion| {
                assert!(ok);
                ran.fetch_add(1, Ordering::SeqCst);
            });
            if i % 2 == 0 {
                handle.cancel();
            }
            tags.push(tag);
            handles.push(handle);
        }

        // Transport side: return every tag from a background thread.
        let transport = thread::spawn(move || {
            for tag in tags {
                tag.complete(true);
            }
        });
        transport.join().unwrap();
        queue.run_until_idle();

        assert_eq!(ran.load(Ordering::SeqCst), 5_000);
        for handle in &handles {
            assert!(handle.is_off_queue());
        }
    }

    #[test]
    fn concurrent_cancel_never_runs_action_twice() {
        // Cancel racing complete from another thread: the action may or may
        // not run, but never more than once and the signal always fires.
        for _ in 0..200 {
            let queue = new_queue();
            let ran = Arc::new(AtomicUsize::new(0));
            let ran_clone = ran.clone();

            let (tag, handle) = Completion::new(queue.clone(), move |_, _: &Completion| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            });

            let canceller = thread::spawn(move || {
                handle.cancel();
                handle.wait_until_off_queue();
            });
            tag.complete(true);
            canceller.join().unwrap();

            queue.run_until_idle();
            assert!(ran.load(Ordering::SeqCst) <= 1);
        }
    }
}

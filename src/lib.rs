//! cq-bridge: completion tags bridging a blocking RPC completion queue onto
//! a single-threaded dispatch queue.
//!
//! An asynchronous RPC transport returns finished operations as opaque tags
//! off arbitrary background threads. The consuming system needs every
//! reaction to run serialized on one logical queue, and needs to be able to
//! retract a reaction when its stream has been torn down. This crate
//! provides the tag object sitting on that boundary: the [`Completion`] tag
//! handed to the transport, the [`CompletionHandle`] the stream owner keeps
//! for cancellation and the off-queue rendezvous, and a [`DispatchQueue`]
//! serialized executor the deferred actions run on.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use cq_bridge::{Completion, DispatchQueue};
//!
//! let queue = Arc::new(DispatchQueue::new());
//!
//! let (tag, handle) = Completion::new(queue.clone(), |ok, tag: &Completion| {
//!     // Runs on the dispatch queue once the transport returns the tag.
//!     println!("read finished (ok={ok}): {} bytes", tag.buffer().len());
//! });
//!
//! // The transport holds `tag` while the operation is in flight, fills in
//! // the output slots, and eventually returns it from a poller thread:
//! let mut tag = tag;
//! tag.buffer_mut().extend_from_slice(b"response");
//! tag.complete(true);
//!
//! // The owner thread drains the queue on its own schedule.
//! queue.run_until_idle();
//!
//! // During teardown the owner would instead call `handle.cancel()` and
//! // `handle.wait_until_off_queue()` before freeing shared stream state.
//! assert!(handle.is_off_queue());
//! ```

pub mod completion;
pub mod dispatch;
pub mod status;

// Re-exports for convenience
pub use completion::{Action, Completion, CompletionHandle, WaitStatus};
pub use dispatch::{Dispatch, DispatchQueue, Task};
pub use status::{Status, StatusCode};

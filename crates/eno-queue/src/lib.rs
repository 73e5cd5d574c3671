//! Rate-limited work queue with dedup-on-enqueue.
//!
//! The ordering and backoff behavior of the whole engine hangs off three
//! guarantees made here:
//! - a key present in the queue is not enqueued twice,
//! - a key being processed is never handed to a second worker; re-adds
//!   during processing are delivered once the first worker calls `done`,
//! - per-key failures back off exponentially until `forget`.

pub mod jitter;
pub mod queue;

pub use jitter::jittered;
pub use queue::Queue;

//! A reusable worker-pool primitive for executing independent short-lived
//! tasks on a fixed (but growable) set of long-running worker threads, fed
//! by a bounded or unbounded FIFO queue.
//!
//! The crate is split into the two pieces that carry the design:
//! [`queue::MsgQueue`], a dual-locked producer/consumer FIFO, and
//! [`pool::ThreadPool`], the worker lifecycle built on top of it. Most
//! callers only need [`pool::ThreadPool`]; [`queue::MsgQueue`] is exposed
//! directly for embedding the same backpressure primitive elsewhere.

pub mod pool;
pub mod queue;

pub use pool::{PendingHook, PoolError, PoolResult, Task, ThreadPool};
pub use queue::MsgQueue;

//! Inter-thread synchronization (spec.md §4.10): an adaptive mutex that
//! escalates from spinning to blocking under contention, with FIFO
//! hand-off and a timed-wait cancellation path.

mod mutex;

pub use mutex::{Mutex, MutexGuard};

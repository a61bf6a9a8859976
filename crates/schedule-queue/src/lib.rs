//! Schedule Queue
//!
//! Time-ordered work queue: blocking pop in due-time order, re-push from
//! workers, predicate removal of pending items, and drain-on-close.

mod queue;

pub use queue::ScheduleQueue;

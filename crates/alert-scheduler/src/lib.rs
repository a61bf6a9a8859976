//! Alert Source Scheduling
//!
//! Repeatedly evaluates alert sources at the cadence each source asks for:
//! - `MultiSource` merges several sources with independent next-due times
//! - `ProcessorManager` binds sources to handlers and runs them on a bounded
//!   worker pool, isolating failures and panics

mod manager;
mod multi;

use std::time::Duration;

pub use manager::{ManagerConfig, Processor, ProcessorManager};
pub use multi::{MultiEvaluation, MultiSource};

/// Fixed delay before a failed source is evaluated again
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

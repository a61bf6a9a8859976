//! Time Sources

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Source of wall-clock time for scheduling and correlation decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock derived from tokio's monotonic time.
///
/// Anchored at a wall-clock origin when created, then advanced by
/// `tokio::time::Instant`. Under a paused tokio runtime it moves only when
/// tokio's clock does, which makes it the simulated clock for timing tests.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor at the current system time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at an explicit wall-clock time
    pub fn starting_at(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_wall + elapsed
    }
}

/// Default shared clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// `at + delay`, saturating at the far future
pub fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

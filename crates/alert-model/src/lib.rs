//! Alert Model
//!
//! Shared vocabulary for the scheduler and the correlation pipeline:
//! - `Alert` occurrences and their `Severity`
//! - `Clock` abstraction (system time or tokio-driven simulated time)
//! - `Source` / `Handler` seams

mod alert;
mod clock;
mod error;
mod seams;

pub use alert::{Alert, Severity};
pub use clock::{after, system_clock, Clock, SharedClock, SystemClock, TokioClock};
pub use error::SourceError;
pub use seams::{Evaluation, Handler, Source};

pub use tokio_util::sync::CancellationToken;

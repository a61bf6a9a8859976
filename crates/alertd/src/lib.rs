//! Alert Daemon
//!
//! Runs configured command checks on the processor manager and feeds their
//! alerts through the correlation pipeline into the log notifier.

pub mod check;
pub mod config;
mod logging;
mod pipeline;

pub use check::{CommandSource, Probe};
pub use config::{CheckConfig, GroupingMode, PipelineConfig, Settings};
pub use logging::init_logging;
pub use pipeline::build_pipeline;

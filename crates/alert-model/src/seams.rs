//! Source and Handler Contracts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{Alert, SourceError};

/// Result of one source evaluation
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Alerts raised or cleared during this round
    pub alerts: Vec<Alert>,
    /// When the source wants to be evaluated again
    pub next: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(alerts: Vec<Alert>, next: DateTime<Utc>) -> Self {
        Self { alerts, next }
    }

    /// Nothing to report; come back at `next`
    pub fn quiet(next: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), next)
    }
}

/// A pull-based alert source that picks its own polling cadence
#[async_trait]
pub trait Source: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "source"
    }

    async fn evaluate(&self, cancel: &CancellationToken) -> Result<Evaluation, SourceError>;
}

/// A push-based alert sink.
///
/// Correlation stages implement this and wrap the next handler; the tail is a
/// notifier-facing adapter. `shutdown` drains any state the handler holds and
/// then shuts down whatever it wraps.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, alerts: Vec<Alert>);

    async fn shutdown(&self) {}
}

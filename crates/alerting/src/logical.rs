//! Logical Deduplication
//!
//! Coalesces repeated start reports of one incident and re-attaches the true
//! start time to the incident's end report.
//!
//! Per logical key the stage remembers the last alert it forwarded. Against
//! that anchor:
//! - an open alert starting within `start_grace` of a still-open anchor is a
//!   restart of the same incident and is suppressed;
//! - a closed alert following an open anchor is the incident's end and takes
//!   the anchor's start time;
//! - a closed alert starting no later than a closed anchor ended repeats an
//!   incident that was already reported and is suppressed.
//!
//! Suppressed alerts never move the anchor.

use alert_model::{Alert, Handler};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use storage::{Cache, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{decode, encode};
use crate::Middleware;

/// Derives the logical identity of an alert
pub type KeyFn = Arc<dyn Fn(&Alert) -> String + Send + Sync>;

/// Default logical key: `source_id-severity`
pub fn severity_key(alert: &Alert) -> String {
    format!("{}-{}", alert.source_id, alert.severity)
}

/// Logical deduplication configuration
#[derive(Clone)]
pub struct LogicalDedupConfig {
    pub key: KeyFn,
    /// Opens closer than this to the open anchor are restarts
    pub start_grace: Duration,
    /// How long an anchor is remembered
    pub ttl: Duration,
}

impl Default for LogicalDedupConfig {
    fn default() -> Self {
        Self {
            key: Arc::new(severity_key),
            start_grace: Duration::from_secs(15 * 60),
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Decide what to forward for `alert` given the key's anchor.
///
/// Returns the alert to forward (possibly with its start restored), or `None`
/// to suppress it.
pub fn reconcile(prev: Option<&Alert>, mut alert: Alert, start_grace: Duration) -> Option<Alert> {
    let Some(prev) = prev else {
        return Some(alert);
    };

    if alert.is_closed() {
        match prev.to {
            None => alert.from = prev.from,
            Some(prev_to) if alert.from <= prev_to => return None,
            Some(_) => {}
        }
        return Some(alert);
    }

    let restarted = chrono::Duration::from_std(start_grace)
        .map_or(true, |grace| alert.from - prev.from < grace);
    if prev.is_open() && restarted {
        return None;
    }
    Some(alert)
}

/// Incident-level deduplication stage
pub struct LogicalDeduplicate {
    config: LogicalDedupConfig,
    cache: Arc<dyn Cache>,
    next: Arc<dyn Handler>,
}

impl LogicalDeduplicate {
    pub fn new(config: LogicalDedupConfig, cache: Arc<dyn Cache>, next: Arc<dyn Handler>) -> Self {
        Self {
            config,
            cache,
            next,
        }
    }

    async fn anchor(&self, key: &str) -> Result<Option<Alert>, StorageError> {
        let Some(bytes) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match decode(&bytes) {
            Ok(alert) => Ok(Some(alert)),
            Err(e) => {
                warn!("Ignoring unreadable anchor for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn process(&self, alert: Alert) -> Result<Option<Alert>, StorageError> {
        let key = (self.config.key)(&alert);
        let prev = self.anchor(&key).await?;

        let Some(alert) = reconcile(prev.as_ref(), alert, self.config.start_grace) else {
            debug!("Logical duplicate suppressed for {}", key);
            return Ok(None);
        };

        self.cache
            .set_for(&key, encode(&alert)?, self.config.ttl)
            .await?;
        Ok(Some(alert))
    }
}

#[async_trait]
impl Handler for LogicalDeduplicate {
    async fn handle(&self, cancel: &CancellationToken, alerts: Vec<Alert>) {
        let mut forward = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let source_id = alert.source_id.clone();
            match self.process(alert).await {
                Ok(Some(alert)) => forward.push(alert),
                Ok(None) => {
                    metrics::counter!("alert_pipeline_suppressed_total", "stage" => "logical_dedup")
                        .increment(1);
                }
                Err(e) => {
                    warn!("Dropping alert for {}: anchor cache failed: {}", source_id, e);
                }
            }
        }

        if !forward.is_empty() {
            self.next.handle(cancel, forward).await;
        }
    }

    async fn shutdown(&self) {
        self.next.shutdown().await;
    }
}

/// Logical deduplication backed by `cache`
pub fn logical_deduplicate(config: LogicalDedupConfig, cache: Arc<dyn Cache>) -> Middleware {
    Box::new(move |next| Arc::new(LogicalDeduplicate::new(config, cache, next)))
}

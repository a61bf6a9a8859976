//! Exact Deduplication

use alert_model::{Alert, Handler};
use async_trait::async_trait;
use std::sync::Arc;
use storage::{Cache, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::encode;
use crate::Middleware;

/// Identity of one exact occurrence: source and start/end seconds
pub fn exact_key(alert: &Alert) -> String {
    format!(
        "{}:{}:{}",
        alert.source_id,
        alert.from.timestamp(),
        alert.to.map_or(0, |to| to.timestamp())
    )
}

/// Drops occurrences already seen within the cache TTL.
///
/// Protects later stages from sources that report the identical occurrence
/// on every poll.
pub struct Deduplicate {
    cache: Arc<dyn Cache>,
    next: Arc<dyn Handler>,
}

impl Deduplicate {
    pub fn new(cache: Arc<dyn Cache>, next: Arc<dyn Handler>) -> Self {
        Self { cache, next }
    }

    /// `true` if the alert is new and has been remembered
    async fn admit(&self, alert: &Alert) -> Result<bool, StorageError> {
        let key = exact_key(alert);
        if self.cache.get(&key).await?.is_some() {
            debug!("Duplicate alert suppressed: {}", key);
            return Ok(false);
        }
        self.cache.set(&key, encode(alert)?).await?;
        Ok(true)
    }
}

#[async_trait]
impl Handler for Deduplicate {
    async fn handle(&self, cancel: &CancellationToken, alerts: Vec<Alert>) {
        let mut forward = Vec::with_capacity(alerts.len());
        for alert in alerts {
            match self.admit(&alert).await {
                Ok(true) => forward.push(alert),
                Ok(false) => {
                    metrics::counter!("alert_pipeline_suppressed_total", "stage" => "dedup")
                        .increment(1);
                }
                Err(e) => {
                    warn!("Dropping alert for {}: dedup cache failed: {}", alert.source_id, e);
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

/// Exact deduplication backed by `cache`
pub fn deduplicate(cache: Arc<dyn Cache>) -> Middleware {
    Box::new(move |next| Arc::new(Deduplicate::new(cache, next)))
}

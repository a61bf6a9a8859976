//! Chronological ordering stage

use alert_model::{Alert, Handler};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::Middleware;

/// Orders each batch by `(from, to)` so later stages see occurrences in
/// chronological order. Open alerts sort before closed ones with the same
/// start.
pub struct Sort {
    next: Arc<dyn Handler>,
}

impl Sort {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for Sort {
    async fn handle(&self, cancel: &CancellationToken, mut alerts: Vec<Alert>) {
        // Stable, so equal spans keep their source order
        alerts.sort_by(|a, b| (a.from, a.to).cmp(&(b.from, b.to)));
        self.next.handle(cancel, alerts).await;
    }

    async fn shutdown(&self) {
        self.next.shutdown().await;
    }
}

pub fn sort() -> Middleware {
    Box::new(|next| Arc::new(Sort::new(next)))
}

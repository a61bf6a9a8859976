//! Terminal Handlers

use alert_model::{Alert, Handler};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::recurring::COUNT_KEY;

/// Logs every alert that survives correlation
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Handler for LogNotifier {
    async fn handle(&self, _cancel: &CancellationToken, alerts: Vec<Alert>) {
        for alert in alerts {
            let state = if alert.is_open() { "firing" } else { "resolved" };
            info!(
                source_id = %alert.source_id,
                severity = %alert.severity,
                from = %alert.from,
                to = ?alert.to,
                count = ?alert.metadata.get(COUNT_KEY),
                notifiers = ?alert.notifiers,
                receivers = ?alert.receivers,
                "Alert {}",
                state
            );
        }
    }
}

/// Hands batches to an external dispatcher over a channel
pub struct ChannelSink {
    sender: mpsc::Sender<Vec<Alert>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Vec<Alert>>) -> Self {
        Self { sender }
    }

    /// Create a sink and the receiver its batches arrive on
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<Alert>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Handler for ChannelSink {
    async fn handle(&self, cancel: &CancellationToken, alerts: Vec<Alert>) {
        let count = alerts.len();
        tokio::select! {
            sent = self.sender.send(alerts) => {
                if sent.is_err() {
                    warn!("Dispatcher channel closed, dropping {} alerts", count);
                }
            }
            _ = cancel.cancelled() => {
                warn!("Cancelled while dispatching, dropping {} alerts", count);
            }
        }
    }
}

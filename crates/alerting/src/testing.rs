//! Shared test fixtures

use alert_model::{Alert, Handler, Severity, TokioClock};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ChannelSink;

pub(crate) fn origin() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// `origin + minutes`
pub(crate) fn at(minutes: i64) -> DateTime<Utc> {
    origin() + chrono::Duration::minutes(minutes)
}

pub(crate) fn clock() -> Arc<TokioClock> {
    Arc::new(TokioClock::starting_at(origin()))
}

pub(crate) fn open(source_id: &str, from: i64) -> Alert {
    Alert::new(source_id, Severity::Low, at(from))
}

pub(crate) fn closed(source_id: &str, from: i64, to: i64) -> Alert {
    open(source_id, from).resolved_at(at(to))
}

/// `(from, to)` in minutes, `to == None` for open alerts
pub(crate) fn span(alert: &Alert) -> (i64, Option<i64>) {
    let minutes = |t: DateTime<Utc>| (t - origin()).num_minutes();
    (minutes(alert.from), alert.to.map(minutes))
}

pub(crate) fn collector() -> (Arc<dyn Handler>, mpsc::Receiver<Vec<Alert>>) {
    let (sink, rx) = ChannelSink::channel(64);
    (Arc::new(sink), rx)
}

/// Every batch delivered so far
pub(crate) fn drain(rx: &mut mpsc::Receiver<Vec<Alert>>) -> Vec<Vec<Alert>> {
    let mut batches = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        batches.push(batch);
    }
    batches
}

//! Windowed Grouping
//!
//! Holds alerts per group key for a fixed window and forwards each window's
//! accumulated batch once when it lapses. Every group is a map entry with a
//! single flush deadline; one background flusher per stage sleeps until the
//! earliest deadline and swaps due groups out under the lock, so each window
//! is flushed exactly once.

use alert_model::{Alert, Handler};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logical::KeyFn;
use crate::Middleware;

/// Merges incoming alerts into a window's accumulator
pub type AggregateFn = Arc<dyn Fn(Vec<Alert>, Vec<Alert>) -> Vec<Alert> + Send + Sync>;

/// Keep the first alert of a window and absorb everything after it.
///
/// The kept alert is emitted when its window ends, not on arrival.
pub fn group_first(mut grouped: Vec<Alert>, incoming: Vec<Alert>) -> Vec<Alert> {
    if grouped.is_empty() {
        grouped.extend(incoming.into_iter().take(1));
    }
    grouped
}

/// Windowed grouping configuration
#[derive(Clone)]
pub struct GroupConfig {
    /// Window length, counted from the alert that opens the group
    pub interval: Duration,
    pub aggregate: AggregateFn,
    /// Group key; `None` puts every alert into one group
    pub key: Option<KeyFn>,
    /// How long shutdown waits for open windows before flushing them early
    pub shutdown_timeout: Duration,
}

impl GroupConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            aggregate: Arc::new(group_first),
            key: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_aggregate(mut self, aggregate: AggregateFn) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn with_key(mut self, key: KeyFn) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

struct PendingGroup {
    alerts: Vec<Alert>,
    flush_at: Instant,
}

struct Shared {
    groups: Mutex<HashMap<String, PendingGroup>>,
    /// Signalled when a new window opens
    opened: Notify,
    interval: Duration,
    aggregate: AggregateFn,
    key: Option<KeyFn>,
    next: Arc<dyn Handler>,
}

impl Shared {
    fn groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingGroup>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.groups().values().map(|g| g.flush_at).min()
    }

    /// Remove every group due by `bound` (all of them for `None`), earliest first
    fn take_due(&self, bound: Option<Instant>) -> Vec<(String, Vec<Alert>)> {
        let mut groups = self.groups();
        let mut due: Vec<(Instant, String)> = groups
            .iter()
            .filter(|(_, g)| bound.map_or(true, |b| g.flush_at <= b))
            .map(|(key, g)| (g.flush_at, key.clone()))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(_, key)| groups.remove(&key).map(|g| (key, g.alerts)))
            .collect()
    }

    async fn flush(&self, ctx: &CancellationToken, bound: Option<Instant>) {
        for (key, alerts) in self.take_due(bound) {
            if alerts.is_empty() {
                continue;
            }
            debug!("Flushing group {:?} with {} alerts", key, alerts.len());
            metrics::counter!("alert_pipeline_forwarded_total", "stage" => "group")
                .increment(alerts.len() as u64);
            self.next.handle(ctx, alerts).await;
        }
    }

    async fn run_flusher(
        self: Arc<Self>,
        drain: CancellationToken,
        force: CancellationToken,
        ctx: CancellationToken,
    ) {
        loop {
            let opened = self.opened.notified();

            if force.is_cancelled() {
                self.flush(&ctx, None).await;
                return;
            }

            let deadline = self.earliest_deadline();
            if deadline.is_none() && drain.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = force.cancelled() => {}
                _ = opened => {}
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(&ctx, Some(Instant::now())).await;
                }
                _ = drain.cancelled(), if deadline.is_none() => {}
            }
        }
    }
}

/// In-memory windowed grouping stage.
///
/// A window's batch is emitted when the window ends, never on arrival. Once
/// shutdown has begun, new alerts bypass grouping and go straight to the
/// next handler.
///
/// Safe for concurrent callers. Must be created inside a tokio runtime.
pub struct WindowGroup {
    shared: Arc<Shared>,
    drain: CancellationToken,
    force: CancellationToken,
    ctx: CancellationToken,
    flusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl WindowGroup {
    pub fn new(config: GroupConfig, next: Arc<dyn Handler>) -> Self {
        let shared = Arc::new(Shared {
            groups: Mutex::new(HashMap::new()),
            opened: Notify::new(),
            interval: config.interval,
            aggregate: config.aggregate,
            key: config.key,
            next,
        });
        let drain = CancellationToken::new();
        let force = CancellationToken::new();
        let ctx = CancellationToken::new();

        let flusher = tokio::spawn(shared.clone().run_flusher(
            drain.clone(),
            force.clone(),
            ctx.clone(),
        ));

        Self {
            shared,
            drain,
            force,
            ctx,
            flusher: tokio::sync::Mutex::new(Some(flusher)),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Number of windows currently open
    pub fn pending(&self) -> usize {
        self.shared.groups().len()
    }

    fn partition(&self, alerts: Vec<Alert>) -> Vec<(String, Vec<Alert>)> {
        let Some(key_fn) = &self.shared.key else {
            return vec![(String::new(), alerts)];
        };

        let mut partitions: Vec<(String, Vec<Alert>)> = Vec::new();
        for alert in alerts {
            let key = key_fn(&alert);
            match partitions.iter_mut().find(|(k, _)| *k == key) {
                Some((_, batch)) => batch.push(alert),
                None => partitions.push((key, vec![alert])),
            }
        }
        partitions
    }
}

#[async_trait]
impl Handler for WindowGroup {
    async fn handle(&self, cancel: &CancellationToken, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }

        let partitions = self.partition(alerts);

        // The flusher may already be gone, so nothing inserted now would be emitted
        if self.drain.is_cancelled() {
            let forward: Vec<Alert> = partitions
                .into_iter()
                .flat_map(|(_, incoming)| (self.shared.aggregate)(Vec::new(), incoming))
                .collect();
            debug!("Grouping stage draining, forwarding {} alerts directly", forward.len());
            if !forward.is_empty() {
                self.shared.next.handle(cancel, forward).await;
            }
            return;
        }

        let now = Instant::now();
        let mut opened = false;
        {
            let mut groups = self.shared.groups();
            for (key, incoming) in partitions {
                let group = groups.entry(key).or_insert_with(|| {
                    opened = true;
                    PendingGroup {
                        alerts: Vec::new(),
                        flush_at: now + self.shared.interval,
                    }
                });
                let grouped = std::mem::take(&mut group.alerts);
                group.alerts = (self.shared.aggregate)(grouped, incoming);
            }
        }

        if opened {
            self.shared.opened.notify_one();
        }
    }

    async fn shutdown(&self) {
        let flusher = self.flusher.lock().await.take();
        if let Some(mut flusher) = flusher {
            self.drain.cancel();
            if tokio::time::timeout(self.shutdown_timeout, &mut flusher)
                .await
                .is_err()
            {
                warn!(
                    "Open windows not flushed within {:?}, flushing {} groups now",
                    self.shutdown_timeout,
                    self.pending()
                );
                self.force.cancel();
                if let Err(e) = flusher.await {
                    warn!("Group flusher ended abnormally: {}", e);
                }
            }
            info!("Grouping stage drained");
        }
        self.shared.next.shutdown().await;
    }
}

impl Drop for WindowGroup {
    fn drop(&mut self) {
        self.ctx.cancel();
        if let Some(flusher) = self.flusher.get_mut().take() {
            flusher.abort();
        }
    }
}

/// In-memory windowed grouping
pub fn group(config: GroupConfig) -> Middleware {
    Box::new(move |next| Arc::new(WindowGroup::new(config, next)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collector, drain, open, span};

    const MINUTE: Duration = Duration::from_secs(60);

    fn collect_all() -> AggregateFn {
        Arc::new(|mut grouped: Vec<Alert>, incoming: Vec<Alert>| {
            grouped.extend(incoming);
            grouped
        })
    }

    #[test]
    fn test_group_first() {
        let grouped = group_first(Vec::new(), vec![open("1", 0), open("1", 1)]);
        assert_eq!(grouped, vec![open("1", 0)]);

        let grouped = group_first(grouped, vec![open("2", 2)]);
        assert_eq!(grouped, vec![open("1", 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_opens_forwarded_once() {
        let (sink, mut rx) = collector();
        let stage = group(GroupConfig::new(15 * MINUTE))(sink);
        let cancel = CancellationToken::new();

        stage.handle(&cancel, vec![open("1", 0)]).await;
        tokio::time::sleep(MINUTE).await;
        stage.handle(&cancel, vec![open("1", 1)]).await;
        tokio::time::sleep(MINUTE).await;
        stage.handle(&cancel, vec![open("1", 2)]).await;
        assert!(drain(&mut rx).is_empty());

        tokio::time::sleep(14 * MINUTE).await;
        let batches = drain(&mut rx);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].iter().map(span).collect::<Vec<_>>(), vec![(0, None)]);

        tokio::time::sleep(60 * MINUTE).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_counts_from_first_alert() {
        let (sink, mut rx) = collector();
        let config = GroupConfig::new(10 * MINUTE).with_aggregate(collect_all());
        let stage = group(config)(sink);
        let cancel = CancellationToken::new();

        stage.handle(&cancel, vec![open("1", 0)]).await;
        tokio::time::sleep(9 * MINUTE).await;
        stage.handle(&cancel, vec![open("1", 9)]).await;
        tokio::time::sleep(2 * MINUTE).await;

        let batches = drain(&mut rx);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_after_flush() {
        let (sink, mut rx) = collector();
        let stage = group(GroupConfig::new(5 * MINUTE))(sink);
        let cancel = CancellationToken::new();

        stage.handle(&cancel, vec![open("1", 0)]).await;
        tokio::time::sleep(6 * MINUTE).await;
        stage.handle(&cancel, vec![open("1", 6)]).await;
        tokio::time::sleep(6 * MINUTE).await;

        let spans: Vec<_> = drain(&mut rx).iter().flatten().map(span).collect();
        assert_eq!(spans, vec![(0, None), (6, None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_groups_flush_separately() {
        let (sink, mut rx) = collector();
        let key: KeyFn = Arc::new(|alert: &Alert| alert.source_id.clone());
        let stage = group(GroupConfig::new(5 * MINUTE).with_key(key))(sink);
        let cancel = CancellationToken::new();

        stage
            .handle(&cancel, vec![open("a", 0), open("b", 0), open("a", 0)])
            .await;
        tokio::time::sleep(6 * MINUTE).await;

        let mut ids: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|batch| {
                assert_eq!(batch.len(), 1);
                batch[0].source_id.clone()
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_open_window() {
        let (sink, mut rx) = collector();
        let stage = group(GroupConfig::new(Duration::from_secs(10)))(sink);

        stage.handle(&CancellationToken::new(), vec![open("1", 0)]).await;
        let started = Instant::now();
        stage.shutdown().await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_flushes_early() {
        let (sink, mut rx) = collector();
        let config = GroupConfig::new(15 * MINUTE).with_shutdown_timeout(Duration::from_secs(30));
        let stage = group(config)(sink);

        stage.handle(&CancellationToken::new(), vec![open("1", 0)]).await;
        let started = Instant::now();
        stage.shutdown().await;

        assert!(started.elapsed() < MINUTE);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_groups_returns() {
        let (sink, mut rx) = collector();
        let stage = group(GroupConfig::new(15 * MINUTE))(sink);

        let started = Instant::now();
        stage.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alerts_after_shutdown_forwarded_directly() {
        let (sink, mut rx) = collector();
        let stage = group(GroupConfig::new(15 * MINUTE))(sink);
        let cancel = CancellationToken::new();

        stage.shutdown().await;
        stage.handle(&cancel, vec![open("1", 0), open("1", 1)]).await;

        let batches = drain(&mut rx);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].iter().map(span).collect::<Vec<_>>(), vec![(0, None)]);
    }
}

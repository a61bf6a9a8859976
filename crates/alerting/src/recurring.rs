//! Recurring Grouping
//!
//! Collapses a condition that is re-reported on every poll into one summary
//! per window. Windows live in a [`GroupRepository`], so a restart picks up
//! where the previous process left off.
//!
//! The first occurrence of a window is forwarded at once, and so is a close
//! that directly follows an open. Anything beyond that is held until the
//! window expires and then forwarded as a single merged alert carrying an
//! occurrence count.
//!
//! The stage is single-writer: `handle` calls and sweeps are serialized by an
//! internal lock. Place it after deduplication and never fan out into it.

use alert_model::{after, system_clock, Alert, Handler, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use storage::{Group, GroupFilter, GroupRepository, StorageError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Middleware;

/// Metadata key holding the occurrence count of a merged alert
pub const COUNT_KEY: &str = "count";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Summarizes a window's occurrences into one alert
pub type MergeFn = Arc<dyn Fn(&[Alert]) -> Option<Alert> + Send + Sync>;

/// Default merge.
///
/// Identity, start and notifiers come from the first occurrence; end,
/// receivers and metadata from the last. `count` is the number of resolved
/// occurrences, plus one if the merged incident is still open.
pub fn merge_alerts(alerts: &[Alert]) -> Option<Alert> {
    let (first, last) = (alerts.first()?, alerts.last()?);

    let mut merged = first.clone();
    merged.to = last.to;
    merged.receivers = last.receivers.clone();
    merged.metadata = last.metadata.clone();

    let mut count = alerts.iter().filter(|a| a.is_closed()).count();
    if merged.is_open() {
        count += 1;
    }
    merged.metadata.insert(COUNT_KEY.to_string(), count.to_string());
    Some(merged)
}

/// Whether a window's newest occurrence is forwarded immediately
pub fn pass_alert(alerts: &[Alert]) -> bool {
    match alerts {
        [_] => true,
        [first, second] => first.is_open() && second.is_closed(),
        _ => false,
    }
}

/// Recurring grouping configuration
#[derive(Clone)]
pub struct RecurringGroupConfig {
    /// Repository key shared by every window of this stage
    pub group_id: String,
    pub group_period: Duration,
    /// Defaults to half the period, kept between one and five minutes
    pub sweep_interval: Option<Duration>,
    pub merge: MergeFn,
    pub clock: SharedClock,
}

impl RecurringGroupConfig {
    pub fn new(group_id: impl Into<String>, group_period: Duration) -> Self {
        Self {
            group_id: group_id.into(),
            group_period,
            sweep_interval: None,
            merge: Arc::new(merge_alerts),
            clock: system_clock(),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn with_merge(mut self, merge: MergeFn) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval
            .unwrap_or_else(|| (self.group_period / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL))
    }
}

struct Shared {
    group_id: String,
    group_period: Duration,
    merge: MergeFn,
    clock: SharedClock,
    repo: Arc<dyn GroupRepository>,
    next: Arc<dyn Handler>,
    writer: tokio::sync::Mutex<()>,
}

impl Shared {
    /// Append `alert` to the current window; returns it if it passes now
    async fn record(&self, alert: Alert) -> Result<Option<Alert>, StorageError> {
        let expires = after(self.clock.now(), self.group_period);
        let filter = GroupFilter::by_id(self.group_id.as_str()).expiring_by(expires);
        let current = self
            .repo
            .find_groups(&filter)
            .await?
            .into_iter()
            .max_by_key(|g| g.exp_at);

        let group = match current {
            None => {
                let group = Group::new(self.group_id.as_str(), expires, vec![alert]);
                self.repo.create_group(&group).await?;
                debug!("Opened window for {} until {}", self.group_id, group.exp_at);
                group
            }
            Some(mut group) => {
                group.alerts.push(alert);
                match self.repo.update_group(&group).await {
                    Ok(()) => group,
                    Err(StorageError::NotFound) => {
                        debug!("Window for {} was swept concurrently, reopening", self.group_id);
                        let alerts = group.alerts.split_off(group.alerts.len() - 1);
                        self.reopen(alerts).await?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        Ok(pass_alert(&group.alerts)
            .then(|| group.alerts.last().cloned())
            .flatten())
    }

    async fn reopen(&self, alerts: Vec<Alert>) -> Result<Group, StorageError> {
        let anchor = alerts.first().map_or_else(|| self.clock.now(), |a| a.from);
        let group = Group::new(self.group_id.as_str(), after(anchor, self.group_period), alerts);
        self.repo.create_group(&group).await?;
        Ok(group)
    }

    /// Flush windows expiring by `bound`; returns how many alerts were forwarded
    async fn sweep(&self, bound: DateTime<Utc>, ctx: &CancellationToken) -> Result<usize, StorageError> {
        let merged = {
            let _writer = self.writer.lock().await;

            let filter = GroupFilter::by_id(self.group_id.as_str()).expiring_by(bound);
            let expired = self.repo.find_groups(&filter).await?;
            if expired.is_empty() {
                return Ok(0);
            }

            let merged: Vec<Alert> = expired
                .iter()
                .filter(|g| !pass_alert(&g.alerts))
                .filter_map(|g| (self.merge)(&g.alerts))
                .collect();

            let uids = expired.iter().map(|g| g.uid).collect();
            let deleted = self.repo.delete(&GroupFilter::by_uids(uids)).await?;
            debug!("Swept {} windows for {}", deleted, self.group_id);
            merged
        };

        let count = merged.len();
        if count > 0 {
            metrics::counter!("alert_pipeline_forwarded_total", "stage" => "recurring")
                .increment(count as u64);
            self.next.handle(ctx, merged).await;
        }
        Ok(count)
    }

    async fn run_sweeper(self: Arc<Self>, interval: Duration, stop: CancellationToken, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(self.clock.now(), &ctx).await {
                        warn!("Sweep of {} failed: {}", self.group_id, e);
                    }
                }
            }
        }
    }
}

/// Persisted recurring grouping stage. Must be created inside a tokio runtime.
pub struct RecurringGroup {
    shared: Arc<Shared>,
    stop: CancellationToken,
    ctx: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RecurringGroup {
    pub fn new(config: RecurringGroupConfig, repo: Arc<dyn GroupRepository>, next: Arc<dyn Handler>) -> Self {
        let interval = config.effective_sweep_interval();
        let shared = Arc::new(Shared {
            group_id: config.group_id,
            group_period: config.group_period,
            merge: config.merge,
            clock: config.clock,
            repo,
            next,
            writer: tokio::sync::Mutex::new(()),
        });
        let stop = CancellationToken::new();
        let ctx = CancellationToken::new();

        info!(
            "Recurring grouping for {} every {:?}, sweeping every {:?}",
            shared.group_id, shared.group_period, interval
        );
        let sweeper = tokio::spawn(shared.clone().run_sweeper(interval, stop.clone(), ctx.clone()));

        Self {
            shared,
            stop,
            ctx,
            sweeper: tokio::sync::Mutex::new(Some(sweeper)),
        }
    }
}

#[async_trait]
impl Handler for RecurringGroup {
    async fn handle(&self, cancel: &CancellationToken, alerts: Vec<Alert>) {
        let mut forward = Vec::new();
        {
            let _writer = self.shared.writer.lock().await;
            for alert in alerts {
                let source_id = alert.source_id.clone();
                match self.shared.record(alert).await {
                    Ok(Some(alert)) => forward.push(alert),
                    Ok(None) => {
                        metrics::counter!("alert_pipeline_suppressed_total", "stage" => "recurring")
                            .increment(1);
                    }
                    Err(e) => {
                        warn!("Dropping alert for {}: group store failed: {}", source_id, e);
                    }
                }
            }
        }

        if !forward.is_empty() {
            self.shared.next.handle(cancel, forward).await;
        }
    }

    async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            self.stop.cancel();
            if let Err(e) = sweeper.await {
                warn!("Sweeper for {} ended abnormally: {}", self.shared.group_id, e);
            }

            let bound = after(self.shared.clock.now(), self.shared.group_period);
            match self.shared.sweep(bound, &self.ctx).await {
                Ok(flushed) => info!("Flushed {} grouped alerts for {}", flushed, self.shared.group_id),
                Err(e) => warn!("Final sweep of {} failed: {}", self.shared.group_id, e),
            }
        }
        self.shared.next.shutdown().await;
    }
}

impl Drop for RecurringGroup {
    fn drop(&mut self) {
        self.ctx.cancel();
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Recurring grouping persisted in `repo`
pub fn recurring_group(config: RecurringGroupConfig, repo: Arc<dyn GroupRepository>) -> Middleware {
    Box::new(move |next| Arc::new(RecurringGroup::new(config, repo, next)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, clock, closed, collector, drain, open, span};
    use storage::MemoryGroupRepository;
    use tokio::sync::mpsc;

    const MINUTE: Duration = Duration::from_secs(60);

    fn config() -> RecurringGroupConfig {
        RecurringGroupConfig::new("checks", 30 * MINUTE).with_clock(clock())
    }

    fn stage(repo: Arc<dyn GroupRepository>) -> (Arc<dyn Handler>, mpsc::Receiver<Vec<Alert>>) {
        let (sink, rx) = collector();
        (recurring_group(config(), repo)(sink), rx)
    }

    async fn feed(stage: &Arc<dyn Handler>, alerts: Vec<Alert>) {
        let cancel = CancellationToken::new();
        for alert in alerts {
            stage.handle(&cancel, vec![alert]).await;
            tokio::time::sleep(MINUTE).await;
        }
    }

    /// Every update finds its row already swept
    struct VanishingRepository {
        inner: MemoryGroupRepository,
    }

    #[async_trait]
    impl GroupRepository for VanishingRepository {
        async fn create_group(&self, group: &Group) -> Result<(), StorageError> {
            self.inner.create_group(group).await
        }

        async fn update_group(&self, group: &Group) -> Result<(), StorageError> {
            self.inner.delete(&GroupFilter::by_uids(vec![group.uid])).await?;
            Err(StorageError::NotFound)
        }

        async fn find_groups(&self, filter: &GroupFilter) -> Result<Vec<Group>, StorageError> {
            self.inner.find_groups(filter).await
        }

        async fn delete(&self, filter: &GroupFilter) -> Result<usize, StorageError> {
            self.inner.delete(filter).await
        }
    }

    struct UnreachableRepository;

    #[async_trait]
    impl GroupRepository for UnreachableRepository {
        async fn create_group(&self, _group: &Group) -> Result<(), StorageError> {
            Err(StorageError::BackendError("timeout".to_string()))
        }

        async fn update_group(&self, _group: &Group) -> Result<(), StorageError> {
            Err(StorageError::BackendError("timeout".to_string()))
        }

        async fn find_groups(&self, _filter: &GroupFilter) -> Result<Vec<Group>, StorageError> {
            Err(StorageError::BackendError("timeout".to_string()))
        }

        async fn delete(&self, _filter: &GroupFilter) -> Result<usize, StorageError> {
            Err(StorageError::BackendError("timeout".to_string()))
        }
    }

    #[test]
    fn test_merge_alerts() {
        let first = closed("1", 0, 1).with_notifiers(vec!["mail".to_string()]);
        let last = closed("1", 4, 5)
            .with_receivers(vec!["ops".to_string()])
            .with_metadata("host", "db-2");
        let merged = merge_alerts(&[first, closed("1", 2, 3), last]).unwrap();

        assert_eq!(span(&merged), (0, Some(5)));
        assert_eq!(merged.notifiers, vec!["mail"]);
        assert_eq!(merged.receivers, vec!["ops"]);
        assert_eq!(merged.metadata["host"], "db-2");
        assert_eq!(merged.metadata[COUNT_KEY], "3");
    }

    #[test]
    fn test_merge_counts_open_incident() {
        let merged = merge_alerts(&[closed("1", 0, 1), open("1", 2)]).unwrap();
        assert!(merged.is_open());
        assert_eq!(merged.metadata[COUNT_KEY], "2");

        assert!(merge_alerts(&[]).is_none());
    }

    #[test]
    fn test_pass_alert() {
        assert!(pass_alert(&[open("1", 0)]));
        assert!(pass_alert(&[open("1", 0), closed("1", 0, 1)]));
        assert!(!pass_alert(&[closed("1", 0, 1), closed("1", 2, 3)]));
        assert!(!pass_alert(&[open("1", 0), open("1", 1)]));
        assert!(!pass_alert(&[open("1", 0), closed("1", 0, 1), open("1", 2)]));
        assert!(!pass_alert(&[]));
    }

    #[test]
    fn test_sweep_interval_default() {
        let config = |period| RecurringGroupConfig::new("g", period);
        assert_eq!(config(30 * MINUTE).effective_sweep_interval(), 5 * MINUTE);
        assert_eq!(config(6 * MINUTE).effective_sweep_interval(), 3 * MINUTE);
        assert_eq!(config(MINUTE).effective_sweep_interval(), MINUTE);
        assert_eq!(
            config(MINUTE).with_sweep_interval(Duration::from_secs(5)).effective_sweep_interval(),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_close_pair_forwarded_immediately() {
        let repo = Arc::new(MemoryGroupRepository::new());
        let (stage, mut rx) = stage(repo.clone());

        feed(&stage, vec![open("1", 0), closed("1", 0, 1)]).await;
        let spans: Vec<_> = drain(&mut rx).iter().flatten().map(span).collect();
        assert_eq!(spans, vec![(0, None), (0, Some(1))]);

        tokio::time::sleep(60 * MINUTE).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(repo.group_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_occurrences_merged_at_expiry() {
        let (stage, mut rx) = stage(Arc::new(MemoryGroupRepository::new()));

        feed(&stage, vec![closed("1", 0, 1), closed("1", 2, 3), closed("1", 4, 5)]).await;
        let batches = drain(&mut rx);
        assert_eq!(batches.len(), 1);
        assert_eq!(span(&batches[0][0]), (0, Some(1)));

        tokio::time::sleep(40 * MINUTE).await;
        let batches = drain(&mut rx);
        assert_eq!(batches.len(), 1);
        let merged = &batches[0][0];
        assert_eq!(span(merged), (0, Some(5)));
        assert_eq!(merged.metadata[COUNT_KEY], "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_open_group() {
        let repo = Arc::new(MemoryGroupRepository::new());
        let (stage, mut rx) = stage(repo.clone());

        feed(&stage, vec![open("1", 0), open("1", 1), open("1", 2)]).await;
        assert_eq!(drain(&mut rx).len(), 1);

        stage.shutdown().await;
        let batches = drain(&mut rx);
        assert_eq!(batches.len(), 1);
        let merged = &batches[0][0];
        assert!(merged.is_open());
        assert_eq!(merged.metadata[COUNT_KEY], "1");
        assert_eq!(repo.group_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swept_window_is_reopened() {
        let repo = Arc::new(VanishingRepository {
            inner: MemoryGroupRepository::new(),
        });
        let (stage, mut rx) = stage(repo.clone());

        feed(&stage, vec![open("1", 0), closed("1", 5, 6)]).await;
        assert_eq!(drain(&mut rx).iter().flatten().count(), 2);

        let groups = repo.inner.find_groups(&GroupFilter::default()).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].alerts.len(), 1);
        assert_eq!(groups[0].exp_at, at(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_drops_alerts() {
        let (stage, mut rx) = stage(Arc::new(UnreachableRepository));

        feed(&stage, vec![open("1", 0)]).await;
        assert!(drain(&mut rx).is_empty());

        stage.shutdown().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_survive_restart() {
        let repo = Arc::new(MemoryGroupRepository::new());
        let (first, mut rx) = stage(repo.clone());
        feed(&first, vec![closed("1", 0, 1)]).await;
        drop(first);
        assert_eq!(drain(&mut rx).len(), 1);

        let (second, mut rx) = stage(repo.clone());
        feed(&second, vec![closed("1", 2, 3), closed("1", 4, 5)]).await;
        assert!(drain(&mut rx).is_empty());

        second.shutdown().await;
        let batches = drain(&mut rx);
        assert_eq!(batches[0][0].metadata[COUNT_KEY], "3");
    }
}

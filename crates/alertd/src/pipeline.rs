//! Pipeline assembly from settings

use alert_model::SharedClock;
use alerting::{
    chain, deduplicate, group, logical_deduplicate, recurring_group, severity_key, sort,
    GroupConfig, LogicalDedupConfig, Middleware, RecurringGroupConfig,
};
use std::sync::Arc;
use storage::{MemoryCache, MemoryGroupRepository};
use tracing::info;

use crate::config::{GroupingMode, PipelineConfig};

/// `sort → deduplicate → logical_deduplicate → grouping` for one check.
///
/// Every check gets its own pipeline. Recurring windows are stored under
/// `<group_id>:<check>` and memory windows are keyed by source and severity,
/// so one check's alerts never absorb another's.
pub fn build_pipeline(config: &PipelineConfig, check: &str, clock: SharedClock) -> Middleware {
    let dedup_cache = Arc::new(MemoryCache::new(config.dedup_ttl, clock.clone()));
    let logical_cache = Arc::new(MemoryCache::new(config.logical_ttl, clock.clone()));

    let mut stages = vec![
        sort(),
        deduplicate(dedup_cache),
        logical_deduplicate(
            LogicalDedupConfig {
                key: Arc::new(severity_key),
                start_grace: config.start_grace,
                ttl: config.logical_ttl,
            },
            logical_cache,
        ),
    ];

    match config.grouping {
        GroupingMode::None => {}
        GroupingMode::Window => {
            stages.push(group(
                GroupConfig::new(config.group_interval)
                    .with_key(Arc::new(severity_key))
                    .with_shutdown_timeout(config.shutdown_timeout),
            ));
        }
        GroupingMode::Recurring => {
            let group_id = format!("{}:{}", config.group_id, check);
            let mut recurring = RecurringGroupConfig::new(group_id, config.group_period)
                .with_clock(clock);
            if let Some(interval) = config.sweep_interval {
                recurring = recurring.with_sweep_interval(interval);
            }
            stages.push(recurring_group(
                recurring,
                Arc::new(MemoryGroupRepository::new()),
            ));
        }
    }

    info!("Pipeline for {} built with {:?} grouping", check, config.grouping);
    chain(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alert_model::{Alert, CancellationToken, Handler, Severity, TokioClock};
    use alerting::{ChannelSink, COUNT_KEY};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn origin() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn minute(m: i64) -> DateTime<Utc> {
        origin() + chrono::Duration::minutes(m)
    }

    fn build_for(
        grouping: GroupingMode,
        check: &str,
        sink: Arc<dyn Handler>,
    ) -> Arc<dyn Handler> {
        let config = PipelineConfig {
            grouping,
            ..Default::default()
        };
        let clock = Arc::new(TokioClock::starting_at(origin()));
        build_pipeline(&config, check, clock)(sink)
    }

    fn build(grouping: GroupingMode) -> (Arc<dyn Handler>, mpsc::Receiver<Vec<Alert>>) {
        let (sink, rx) = ChannelSink::channel(16);
        (build_for(grouping, "check", Arc::new(sink)), rx)
    }

    fn sources(alerts: &[Alert]) -> Vec<&str> {
        let mut ids: Vec<&str> = alerts.iter().map(|a| a.source_id.as_str()).collect();
        ids.sort();
        ids
    }

    fn received(rx: &mut mpsc::Receiver<Vec<Alert>>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            alerts.extend(batch);
        }
        alerts
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_incident_reported_open_then_closed() {
        let (pipeline, mut rx) = build(GroupingMode::None);
        let cancel = CancellationToken::new();
        let firing = Alert::new("disk", Severity::High, minute(0));

        // Same incident reported on three polls, then resolved twice
        for _ in 0..3 {
            pipeline.handle(&cancel, vec![firing.clone()]).await;
        }
        let resolved = firing.clone().resolved_at(minute(3));
        pipeline.handle(&cancel, vec![resolved.clone(), resolved]).await;

        let alerts = received(&mut rx);
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].is_open());
        assert_eq!(alerts[1].from, minute(0));
        assert_eq!(alerts[1].to, Some(minute(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_flap_merged_on_shutdown() {
        let (pipeline, mut rx) = build(GroupingMode::Recurring);
        let cancel = CancellationToken::new();

        for m in [0, 2, 4] {
            let flap = Alert::new("link", Severity::Medium, minute(m)).resolved_at(minute(m + 1));
            pipeline.handle(&cancel, vec![flap]).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        assert_eq!(received(&mut rx).len(), 1);

        pipeline.shutdown().await;
        let merged = received(&mut rx);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].metadata[COUNT_KEY], "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_grouping_flushes_on_shutdown() {
        let (pipeline, mut rx) = build(GroupingMode::Window);
        pipeline
            .handle(
                &CancellationToken::new(),
                vec![Alert::new("cpu", Severity::Low, minute(0))],
            )
            .await;
        assert!(received(&mut rx).is_empty());

        pipeline.shutdown().await;
        assert_eq!(received(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_grouping_keeps_checks_apart() {
        let (pipeline, mut rx) = build(GroupingMode::Window);
        let cancel = CancellationToken::new();

        pipeline
            .handle(&cancel, vec![Alert::new("disk", Severity::High, minute(0))])
            .await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        pipeline
            .handle(&cancel, vec![Alert::new("cpu", Severity::High, minute(1))])
            .await;
        assert!(received(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        assert_eq!(sources(&received(&mut rx)), vec!["cpu", "disk"]);

        pipeline.shutdown().await;
        assert!(received(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_grouping_per_check() {
        let (tx, mut rx) = mpsc::channel(16);
        let pipelines: Vec<Arc<dyn Handler>> = ["disk", "cpu"]
            .into_iter()
            .map(|check| {
                let sink = Arc::new(ChannelSink::new(tx.clone()));
                build_for(GroupingMode::Recurring, check, sink)
            })
            .collect();
        let cancel = CancellationToken::new();

        for m in [0, 2, 4] {
            for (pipeline, check) in pipelines.iter().zip(["disk", "cpu"]) {
                let flap = Alert::new(check, Severity::Medium, minute(m)).resolved_at(minute(m + 1));
                pipeline.handle(&cancel, vec![flap]).await;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        assert_eq!(sources(&received(&mut rx)), vec!["cpu", "disk"]);

        for pipeline in &pipelines {
            pipeline.shutdown().await;
        }
        let merged = received(&mut rx);
        assert_eq!(sources(&merged), vec!["cpu", "disk"]);
        assert!(merged.iter().all(|alert| alert.metadata[COUNT_KEY] == "3"));
    }
}

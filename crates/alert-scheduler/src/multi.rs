//! Multi-Source Aggregation

use alert_model::{after, Evaluation, SharedClock, Source, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::DEFAULT_RETRY_INTERVAL;

/// A registered source and when it is next due
struct SourceEntry {
    source: Arc<dyn Source>,
    next: DateTime<Utc>,
}

/// Outcome of one aggregated round
#[derive(Debug)]
pub struct MultiEvaluation {
    /// Alerts from every source that was due, and the earliest next-due time
    /// across all sources
    pub evaluation: Evaluation,
    /// Sources that failed this round, by name
    pub failures: Vec<(String, SourceError)>,
}

/// Several sources behind one `Source`, each on its own cadence.
///
/// A failing source is pushed back by the retry interval and never holds up
/// the others.
pub struct MultiSource {
    entries: Mutex<Vec<SourceEntry>>,
    clock: SharedClock,
    retry_interval: Duration,
}

impl MultiSource {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            clock,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Delay applied to a source after it fails
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    fn entries(&self) -> MutexGuard<'_, Vec<SourceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a source; it is due immediately
    pub fn add(&self, source: Arc<dyn Source>) {
        let next = self.clock.now();
        self.entries().push(SourceEntry { source, next });
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every source whose next-due time has arrived
    pub async fn evaluate_due(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MultiEvaluation, SourceError> {
        let now = self.clock.now();

        // Entries are append-only, so indices stay valid across the awaits below.
        // Due entries are leased for one retry interval so a concurrent round
        // does not pick them up while they are being evaluated.
        let due: Vec<(usize, Arc<dyn Source>)> = {
            let mut entries = self.entries();
            if entries.is_empty() {
                return Err(SourceError::NoSources);
            }
            let lease = after(now, self.retry_interval);
            entries
                .iter_mut()
                .enumerate()
                .filter(|(_, entry)| entry.next <= now)
                .map(|(index, entry)| {
                    entry.next = lease;
                    (index, entry.source.clone())
                })
                .collect()
        };

        let mut alerts = Vec::new();
        let mut failures = Vec::new();
        let mut updates = Vec::with_capacity(due.len());

        for (index, source) in due {
            match source.evaluate(cancel).await {
                Ok(evaluation) => {
                    debug!(
                        "Source {} produced {} alerts, next at {}",
                        source.name(),
                        evaluation.alerts.len(),
                        evaluation.next
                    );
                    alerts.extend(evaluation.alerts);
                    updates.push((index, evaluation.next));
                }
                Err(e) => {
                    updates.push((index, after(now, self.retry_interval)));
                    failures.push((source.name().to_string(), e));
                }
            }
        }

        let next = {
            let mut entries = self.entries();
            for (index, next) in updates {
                if let Some(entry) = entries.get_mut(index) {
                    entry.next = next;
                }
            }
            entries
                .iter()
                .map(|entry| entry.next)
                .min()
                .unwrap_or_else(|| after(now, self.retry_interval))
        };

        Ok(MultiEvaluation {
            evaluation: Evaluation::new(alerts, next),
            failures,
        })
    }
}

#[async_trait]
impl Source for MultiSource {
    fn name(&self) -> &str {
        "multi"
    }

    async fn evaluate(&self, cancel: &CancellationToken) -> Result<Evaluation, SourceError> {
        let round = self.evaluate_due(cancel).await?;
        for (name, e) in &round.failures {
            warn!(
                "Source {} failed, retrying in {:?}: {}",
                name, self.retry_interval, e
            );
        }
        Ok(round.evaluation)
    }
}

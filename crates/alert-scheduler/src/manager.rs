//! Processor Manager Implementation

use alert_model::{after, Handler, SharedClock, Source, SourceError};
use chrono::{DateTime, Utc};
use schedule_queue::ScheduleQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::DEFAULT_RETRY_INTERVAL;

/// Configuration for the processor manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of processors evaluated concurrently
    pub workers: usize,
    /// Delay before a failed processor is tried again
    pub retry_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// A source bound to the handler that receives its alerts
pub struct Processor {
    /// Identifier used for removal
    pub id: String,
    pub source: Arc<dyn Source>,
    pub handler: Arc<dyn Handler>,
}

impl Processor {
    pub fn new(id: impl Into<String>, source: Arc<dyn Source>, handler: Arc<dyn Handler>) -> Self {
        Self {
            id: id.into(),
            source,
            handler,
        }
    }
}

/// Drives the evaluate → handle → reschedule loop for registered processors
pub struct ProcessorManager {
    queue: Arc<ScheduleQueue<Arc<Processor>>>,
    config: ManagerConfig,
    clock: SharedClock,
}

impl ProcessorManager {
    /// Create a new processor manager
    pub fn new(config: ManagerConfig, clock: SharedClock) -> Self {
        info!("Creating processor manager with config: {:?}", config);
        Self {
            queue: Arc::new(ScheduleQueue::new(clock.clone())),
            config,
            clock,
        }
    }

    /// Schedule a processor for immediate evaluation.
    ///
    /// Returns `false` if the manager has been closed.
    pub fn add_processor(&self, processor: Processor) -> bool {
        debug!("Adding processor {}", processor.id);
        self.queue.push(Arc::new(processor), self.clock.now())
    }

    /// Cancel a processor that is waiting for its next evaluation.
    ///
    /// A processor that is currently executing is not affected.
    pub fn remove_processor(&self, id: &str) -> bool {
        let removed = self.queue.remove_first_func(|p| p.id == id).is_some();
        if removed {
            info!("Removed processor {}", id);
        }
        removed
    }

    /// Stop accepting processors; `run` returns once the queue drains
    pub fn close(&self) {
        info!("Closing processor manager");
        self.queue.close();
    }

    /// Number of processors waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run until the queue is exhausted or `cancel` fires, then wait for
    /// in-flight evaluations to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!("Starting processor manager with {} workers", workers);

        let semaphore = Arc::new(Semaphore::new(workers));

        while let Some(processor) = self.queue.pop_wait(&cancel).await {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => {
                    // Hand it back so a later run picks it up
                    self.queue.push(processor, self.clock.now());
                    break;
                }
            };

            let queue = self.queue.clone();
            let clock = self.clock.clone();
            let retry_interval = self.config.retry_interval;
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let next = supervise(&processor, &clock, retry_interval, &cancel).await;
                // No-op once the queue is closed
                queue.push(processor, next);
                drop(permit);
            });
        }

        info!("Processor manager stopping, awaiting running evaluations");
        // All permits come back only after every spawned evaluation finished
        let _ = semaphore.acquire_many(workers as u32).await;
        info!("Processor manager stopped");
    }
}

/// Evaluate one processor in its own task and decide when it runs next.
///
/// Errors and panics both count as failures and push the processor back by
/// the retry interval.
async fn supervise(
    processor: &Arc<Processor>,
    clock: &SharedClock,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> DateTime<Utc> {
    let task = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { process(&processor, &cancel).await })
    };

    match task.await {
        Ok(Ok(next)) => next,
        Ok(Err(e)) => {
            warn!(
                "Processor {} failed, retrying in {:?}: {}",
                processor.id, retry_interval, e
            );
            metrics::counter!("alert_processor_failures_total").increment(1);
            after(clock.now(), retry_interval)
        }
        Err(e) => {
            error!(
                "Processor {} task aborted, retrying in {:?}: {}",
                processor.id, retry_interval, e
            );
            metrics::counter!("alert_processor_failures_total").increment(1);
            after(clock.now(), retry_interval)
        }
    }
}

async fn process(
    processor: &Processor,
    cancel: &CancellationToken,
) -> Result<DateTime<Utc>, SourceError> {
    let evaluation = processor.source.evaluate(cancel).await?;
    if !evaluation.alerts.is_empty() {
        debug!(
            "Processor {} handing {} alerts to its handler",
            processor.id,
            evaluation.alerts.len()
        );
        processor.handler.handle(cancel, evaluation.alerts).await;
    }
    Ok(evaluation.next)
}

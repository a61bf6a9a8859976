//! Alerting Pipeline
//!
//! Correlates raw alert occurrences before they reach a notifier: ordering,
//! exact and incident-level deduplication, and windowed or persisted grouping.
//! Each stage is a [`Middleware`] wrapping the next [`Handler`]; compose them
//! with [`chain`].
//!
//! [`Handler`]: alert_model::Handler

mod codec;
mod dedup;
mod grouping;
mod logical;
mod middleware;
mod recurring;
mod sink;
mod sort;

#[cfg(test)]
mod testing;

pub use dedup::{deduplicate, exact_key, Deduplicate};
pub use grouping::{group, group_first, AggregateFn, GroupConfig, WindowGroup};
pub use logical::{
    logical_deduplicate, reconcile, severity_key, KeyFn, LogicalDedupConfig, LogicalDeduplicate,
};
pub use middleware::{chain, Middleware};
pub use recurring::{
    merge_alerts, pass_alert, recurring_group, MergeFn, RecurringGroup, RecurringGroupConfig,
    COUNT_KEY,
};
pub use sink::{ChannelSink, LogNotifier};
pub use sort::{sort, Sort};

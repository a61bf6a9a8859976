//! Alert Occurrences

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lowercase name, as used in logical keys and settings
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reported occurrence of an alert-worthy condition.
///
/// `to == None` means the condition is still firing; `Some(t)` means it was
/// resolved at `t`. Alerts are plain values: stages clone and adjust their own
/// copy, nothing is shared mutably between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Monitored entity this occurrence belongs to
    pub source_id: String,
    pub severity: Severity,
    /// When the condition started
    pub from: DateTime<Utc>,
    /// When the condition was resolved, if it was
    pub to: Option<DateTime<Utc>>,
    /// Notification channels to use
    pub notifiers: Vec<String>,
    /// Recipients on those channels
    pub receivers: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Alert {
    /// Create an open alert starting at `from`
    pub fn new(source_id: impl Into<String>, severity: Severity, from: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            severity,
            from,
            to: None,
            notifiers: Vec::new(),
            receivers: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Mark the alert as resolved at `to`
    pub fn resolved_at(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_notifiers(mut self, notifiers: Vec<String>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn with_receivers(mut self, receivers: Vec<String>) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Still firing
    pub fn is_open(&self) -> bool {
        self.to.is_none()
    }

    /// Resolved
    pub fn is_closed(&self) -> bool {
        self.to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_and_closed() {
        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let alert = Alert::new("disk", Severity::High, from);
        assert!(alert.is_open());

        let closed = alert.resolved_at(from + chrono::Duration::minutes(5));
        assert!(closed.is_closed());
        assert!(!closed.is_open());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::Critical.to_string(), "critical");
    }

    #[test]
    fn test_severity_serde_name() {
        let json = serde_json::to_string(&Severity::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
        let parsed: Severity = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Severity::Low);
    }
}

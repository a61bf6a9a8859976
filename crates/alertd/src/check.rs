//! Command Checks
//!
//! Shell commands used as alert sources. A failing command (non-zero exit,
//! killed, or over its timeout) raises an alert that stays open, with the time
//! of the first failure as its start, until the command succeeds again.

use alert_model::{after, Alert, Evaluation, SharedClock, Source, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CheckConfig;

const MAX_OUTPUT: usize = 512;

/// Outcome of one command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// `None` when killed or timed out
    pub exit_code: Option<i32>,
    pub output: String,
}

impl Probe {
    pub fn healthy(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Alert source backed by a shell command
pub struct CommandSource {
    config: CheckConfig,
    clock: SharedClock,
    failing_since: Mutex<Option<DateTime<Utc>>>,
}

impl CommandSource {
    pub fn new(config: CheckConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            failing_since: Mutex::new(None),
        }
    }

    async fn probe(&self, cancel: &CancellationToken) -> Result<Probe, SourceError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.config.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tokio::select! {
            _ = cancel.cancelled() => Err(SourceError::Cancelled),
            result = tokio::time::timeout(self.config.timeout, command.output()) => match result {
                Ok(output) => {
                    let output = output?;
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    Ok(Probe {
                        exit_code: output.status.code(),
                        output: truncate(text.trim()),
                    })
                }
                Err(_) => Ok(Probe {
                    exit_code: None,
                    output: format!("timed out after {:?}", self.config.timeout),
                }),
            },
        }
    }

    /// Fold a probe into the open/closed state and build the alert to report
    pub fn observe(&self, probe: &Probe, now: DateTime<Utc>) -> Option<Alert> {
        let mut failing_since = self
            .failing_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if probe.healthy() {
            let from = failing_since.take()?;
            info!("Check {} recovered", self.config.name);
            return Some(self.alert(from, probe).resolved_at(now));
        }

        if failing_since.is_none() {
            info!("Check {} failing: {}", self.config.name, probe.output);
        }
        let from = *failing_since.get_or_insert(now);
        Some(self.alert(from, probe))
    }

    fn alert(&self, from: DateTime<Utc>, probe: &Probe) -> Alert {
        let exit_code = probe
            .exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string());

        Alert::new(self.config.name.as_str(), self.config.severity, from)
            .with_notifiers(self.config.notifiers.clone())
            .with_receivers(self.config.receivers.clone())
            .with_metadata("check", self.config.name.as_str())
            .with_metadata("command", self.config.command.as_str())
            .with_metadata("exit_code", exit_code)
            .with_metadata("output", probe.output.as_str())
    }
}

#[async_trait]
impl Source for CommandSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn evaluate(&self, cancel: &CancellationToken) -> Result<Evaluation, SourceError> {
        let probe = self.probe(cancel).await?;
        let now = self.clock.now();
        debug!("Check {} exited with {:?}", self.config.name, probe.exit_code);

        let alerts = self.observe(&probe, now).into_iter().collect();
        Ok(Evaluation::new(alerts, after(now, self.config.interval)))
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_OUTPUT) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

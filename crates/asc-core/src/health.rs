//! Health classification and recovery bookkeeping.

use crate::WorkerName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What is wrong with a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    /// A process record exists but the process is gone.
    Crashed,
    /// Process is running but the agent has not reported within the offline threshold.
    Unresponsive,
    /// Working on the same task for longer than the stuck threshold.
    Stuck,
    /// The agent itself reported an error state.
    ExplicitError,
}

impl HealthIssueKind {
    /// What the monitor may do about this issue. `None` for report-only issues.
    pub fn recovery(&self) -> Option<RecoveryKind> {
        match self {
            Self::Crashed | Self::Unresponsive => Some(RecoveryKind::Restart),
            Self::Stuck => Some(RecoveryKind::ReleaseLeases),
            Self::ExplicitError => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Crashed | Self::Unresponsive => Severity::Critical,
            Self::Stuck | Self::ExplicitError => Severity::Warning,
        }
    }
}

impl fmt::Display for HealthIssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Crashed => "crashed",
            Self::Unresponsive => "unresponsive",
            Self::Stuck => "stuck",
            Self::ExplicitError => "error",
        };
        f.write_str(s)
    }
}

/// The action an automatic recovery takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Stop the process if one is recorded, then start it again.
    #[default]
    Restart,
    /// Release the agent's leases and leave the process running.
    ReleaseLeases,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Restart => "restart",
            Self::ReleaseLeases => "release_leases",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// A detected health problem. Cleared when the underlying condition resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub worker: WorkerName,
    pub kind: HealthIssueKind,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// Human readable detail.
    pub description: String,
    /// Whether an automatic recovery was attempted for this issue.
    pub recovery_attempted: bool,
}

impl HealthIssue {
    pub fn new(
        worker: WorkerName,
        kind: HealthIssueKind,
        detected_at: DateTime<Utc>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            kind,
            severity: kind.severity(),
            detected_at,
            description: description.into(),
            recovery_attempted: false,
        }
    }
}

/// Summarize a set of issues in one line.
pub fn summarize(issues: &[HealthIssue]) -> String {
    if issues.is_empty() {
        return "All agents healthy".to_string();
    }
    let critical = issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .count();
    let warning = issues.len() - critical;
    format!("{critical} critical, {warning} warning")
}

/// One automatic recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub worker: WorkerName,
    pub issue: HealthIssueKind,
    #[serde(default)]
    pub kind: RecoveryKind,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-worker recovery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    /// Failures since the last success. Drives the retry backoff.
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl RecoveryStats {
    pub fn record(&mut self, action: &RecoveryAction) {
        self.attempts += 1;
        self.last_attempt = Some(action.timestamp);
        if action.success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
        }
    }

    /// Fraction of attempts that succeeded, in `[0, 1]`. Zero when never attempted.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(self.attempts)
        }
    }
}

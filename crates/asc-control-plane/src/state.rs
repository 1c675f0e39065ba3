//! Agent state model.
//!
//! Owned and mutated only by the coordinator loop; readers get immutable
//! `Arc` snapshots through a watch channel.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use asc_core::{
    AgentState, AgentStatus, ConfigError, HealthIssue, Message, RecoveryAction, RecoveryStats,
    StatusEvent, Task, WorkerName,
};

use crate::reconciler::ReconcileReport;

/// A state imposed by the health monitor, held until a newer status arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Forced {
    state: AgentState,
    at: DateTime<Utc>,
}

/// Link health towards the status relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connectivity {
    /// The event stream is currently up.
    pub push_connected: bool,

    /// Statuses have not been refreshed since the event stream was lost.
    pub statuses_stale: bool,

    /// Last error reported by the event stream.
    pub last_push_error: Option<String>,

    /// Last error from a pull request.
    pub last_pull_error: Option<String>,

    /// Time of the last successful status pull.
    pub last_pull: Option<DateTime<Utc>>,
}

impl Connectivity {
    /// Whether the relay link is degraded.
    pub fn is_degraded(&self) -> bool {
        self.statuses_stale || self.last_pull_error.is_some()
    }
}

/// Runtime view of every declared agent.
#[derive(Debug, Clone)]
pub struct AgentStateModel {
    offline_threshold: Duration,
    message_cap: usize,
    recovery_cap: usize,

    declared: BTreeSet<WorkerName>,
    reported: HashMap<WorkerName, AgentStatus>,
    forced: HashMap<WorkerName, Forced>,

    messages: VecDeque<Message>,
    tasks: Vec<Task>,

    issues: Vec<HealthIssue>,
    recoveries: VecDeque<RecoveryAction>,
    recovery_stats: HashMap<WorkerName, RecoveryStats>,

    connectivity: Connectivity,
    config_error: Option<ConfigError>,
    last_reconcile: Option<ReconcileReport>,
}

impl AgentStateModel {
    pub fn new(offline_threshold: Duration, message_cap: usize, recovery_cap: usize) -> Self {
        Self {
            offline_threshold,
            message_cap: message_cap.max(1),
            recovery_cap: recovery_cap.max(1),
            declared: BTreeSet::new(),
            reported: HashMap::new(),
            forced: HashMap::new(),
            messages: VecDeque::new(),
            tasks: Vec::new(),
            issues: Vec::new(),
            recoveries: VecDeque::new(),
            recovery_stats: HashMap::new(),
            connectivity: Connectivity::default(),
            config_error: None,
            last_reconcile: None,
        }
    }

    pub fn offline_threshold(&self) -> Duration {
        self.offline_threshold
    }

    /// Replace the set of agents readers see. Overrides for removed agents are dropped.
    pub fn set_declared(&mut self, names: impl IntoIterator<Item = WorkerName>) {
        self.declared = names.into_iter().collect();
        let declared = &self.declared;
        self.forced.retain(|name, _| declared.contains(name));
    }

    pub fn declared(&self) -> impl Iterator<Item = &WorkerName> {
        self.declared.iter()
    }

    /// Record a status report. Returns false if it was older than what we have.
    ///
    /// Pushed statuses without a timestamp are stamped with `now`. A status
    /// with no timestamp never replaces one that has been seen.
    pub fn apply_status(&mut self, mut status: AgentStatus, now: DateTime<Utc>, pushed: bool) -> bool {
        if pushed && status.last_seen.is_none() {
            status.last_seen = Some(now);
        }

        if let Some(existing) = self.reported.get(&status.name) {
            match (existing.last_seen, status.last_seen) {
                (Some(old), Some(new)) if new < old => return false,
                (Some(_), None) => return false,
                _ => {}
            }
        }

        if let (Some(forced), Some(seen)) = (self.forced.get(&status.name), status.last_seen) {
            if seen > forced.at {
                self.forced.remove(&status.name);
            }
        }

        self.reported.insert(status.name.clone(), status);
        true
    }

    /// Record a full pull of statuses.
    pub fn apply_pulled_statuses(&mut self, statuses: Vec<AgentStatus>, now: DateTime<Utc>) {
        for status in statuses {
            self.apply_status(status, now, false);
        }
        self.connectivity.statuses_stale = false;
        self.connectivity.last_pull_error = None;
        self.connectivity.last_pull = Some(now);
    }

    /// Apply one event from the push stream.
    pub fn apply_event(&mut self, event: StatusEvent, now: DateTime<Utc>) {
        match event {
            StatusEvent::Connected => {
                self.connectivity.push_connected = true;
                self.connectivity.last_push_error = None;
            }
            StatusEvent::Disconnected => {
                self.connectivity.push_connected = false;
                self.connectivity.statuses_stale = true;
            }
            StatusEvent::AgentStatusChanged(status) => {
                self.apply_status(status, now, true);
            }
            StatusEvent::NewMessage(message) => self.push_message(message),
            StatusEvent::Error(reason) => self.connectivity.last_push_error = Some(reason),
        }
    }

    pub fn record_pull_error(&mut self, error: String) {
        self.connectivity.last_pull_error = Some(error);
    }

    /// Impose a state until a status newer than `at` arrives.
    pub fn force_state(&mut self, name: &WorkerName, state: AgentState, at: DateTime<Utc>) {
        self.forced.insert(name.clone(), Forced { state, at });
    }

    /// Last reported status, without offline derivation or overrides.
    pub fn reported(&self, name: &str) -> Option<&AgentStatus> {
        self.reported.get(name)
    }

    /// Effective status of one declared agent.
    pub fn status(&self, name: &str, now: DateTime<Utc>) -> Option<AgentStatus> {
        let name = self.declared.get(name)?;
        Some(self.effective(name, now))
    }

    /// Effective status of every declared agent, sorted by name.
    pub fn statuses(&self, now: DateTime<Utc>) -> Vec<AgentStatus> {
        self.declared.iter().map(|name| self.effective(name, now)).collect()
    }

    fn effective(&self, name: &WorkerName, now: DateTime<Utc>) -> AgentStatus {
        let mut status = self
            .reported
            .get(name)
            .cloned()
            .unwrap_or_else(|| AgentStatus::offline(name.clone()));

        if let Some(forced) = self.forced.get(name) {
            status.state = forced.state;
        } else if status.is_stale(now, self.offline_threshold) {
            status.state = AgentState::Offline;
        }
        status
    }

    /// Add a message, dropping exact duplicates and the oldest entry when full.
    pub fn push_message(&mut self, message: Message) {
        if self.messages.contains(&message) {
            return;
        }
        self.messages.push_back(message);
        while self.messages.len() > self.message_cap {
            self.messages.pop_front();
        }
    }

    /// Messages oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn set_tasks(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks;
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn set_issues(&mut self, issues: Vec<HealthIssue>) {
        self.issues = issues;
    }

    pub fn issues(&self) -> &[HealthIssue] {
        &self.issues
    }

    pub fn record_recovery(&mut self, action: RecoveryAction) {
        self.recovery_stats
            .entry(action.worker.clone())
            .or_default()
            .record(&action);
        self.recoveries.push_back(action);
        while self.recoveries.len() > self.recovery_cap {
            self.recoveries.pop_front();
        }
    }

    /// Recovery actions oldest first.
    pub fn recovery_history(&self) -> impl Iterator<Item = &RecoveryAction> {
        self.recoveries.iter()
    }

    pub fn recovery_stats(&self, name: &str) -> Option<&RecoveryStats> {
        self.recovery_stats.get(name)
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn set_config_error(&mut self, error: Option<ConfigError>) {
        self.config_error = error;
    }

    /// The last rejected reload, cleared by the next successful one.
    pub fn config_error(&self) -> Option<&ConfigError> {
        self.config_error.as_ref()
    }

    pub fn set_last_reconcile(&mut self, report: ReconcileReport) {
        self.last_reconcile = Some(report);
    }

    pub fn last_reconcile(&self) -> Option<&ReconcileReport> {
        self.last_reconcile.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asc_core::{HealthIssueKind, MessageType, RecoveryKind};

    const THRESHOLD: Duration = Duration::from_secs(120);

    fn model(names: &[&str]) -> AgentStateModel {
        let mut model = AgentStateModel::new(THRESHOLD, 3, 2);
        model.set_declared(names.iter().map(|n| WorkerName::new(*n)));
        model
    }

    fn ago(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        now - chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_undeclared_agents_are_hidden_and_unknown_are_offline() {
        let now = Utc::now();
        let mut model = model(&["coder"]);
        model.apply_status(AgentStatus::new("stranger", AgentState::Idle).seen_at(now), now, false);

        let statuses = model.statuses(now);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name.as_str(), "coder");
        assert_eq!(statuses[0].state, AgentState::Offline);
        assert!(model.status("stranger", now).is_none());
    }

    #[test]
    fn test_offline_is_derived_from_last_seen() {
        let now = Utc::now();
        for threshold in [1u64, 30, 120, 600] {
            for age in [0i64, 1, 2, 29, 31, 119, 121, 599, 601] {
                let mut model = AgentStateModel::new(Duration::from_secs(threshold), 10, 10);
                model.set_declared([WorkerName::new("a")]);
                model.apply_status(
                    AgentStatus::new("a", AgentState::Working).seen_at(ago(now, age)),
                    now,
                    false,
                );
                let state = model.status("a", now).unwrap().state;
                assert_eq!(
                    state == AgentState::Offline,
                    age as u64 > threshold,
                    "age={age} threshold={threshold}"
                );
            }
        }
    }

    #[test]
    fn test_older_status_is_ignored() {
        let now = Utc::now();
        let mut model = model(&["a"]);
        assert!(model.apply_status(AgentStatus::new("a", AgentState::Working).seen_at(ago(now, 5)), now, true));
        assert!(!model.apply_status(AgentStatus::new("a", AgentState::Idle).seen_at(ago(now, 10)), now, false));
        assert!(!model.apply_status(AgentStatus::new("a", AgentState::Offline), now, false));
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Working);

        // Same timestamp wins: last writer.
        assert!(model.apply_status(AgentStatus::new("a", AgentState::Error).seen_at(ago(now, 5)), now, false));
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Error);
    }

    #[test]
    fn test_pushed_status_without_timestamp_is_stamped() {
        let now = Utc::now();
        let mut model = model(&["a"]);
        model.apply_event(
            StatusEvent::AgentStatusChanged(AgentStatus::new("a", AgentState::Idle)),
            now,
        );
        assert_eq!(model.reported("a").unwrap().last_seen, Some(now));
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Idle);
    }

    #[test]
    fn test_forced_state_holds_until_newer_status() {
        let now = Utc::now();
        let mut model = model(&["a"]);
        model.apply_status(AgentStatus::new("a", AgentState::Working).seen_at(ago(now, 10)), now, false);

        model.force_state(&WorkerName::new("a"), AgentState::Offline, ago(now, 5));
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Offline);

        // Replaying the same heartbeat does not clear the override.
        model.apply_status(AgentStatus::new("a", AgentState::Working).seen_at(ago(now, 10)), now, false);
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Offline);

        model.apply_status(AgentStatus::new("a", AgentState::Idle).seen_at(ago(now, 1)), now, true);
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Idle);
    }

    #[test]
    fn test_disconnect_marks_stale_until_pull() {
        let now = Utc::now();
        let mut model = model(&["a"]);
        model.apply_event(StatusEvent::Connected, now);
        assert!(model.connectivity().push_connected);

        model.apply_event(StatusEvent::Disconnected, now);
        model.apply_event(StatusEvent::Error("connection refused".into()), now);
        assert!(!model.connectivity().push_connected);
        assert!(model.connectivity().statuses_stale);
        assert!(model.connectivity().is_degraded());
        assert_eq!(model.connectivity().last_push_error.as_deref(), Some("connection refused"));

        model.apply_pulled_statuses(vec![AgentStatus::new("a", AgentState::Idle).seen_at(now)], now);
        assert!(!model.connectivity().statuses_stale);
        assert_eq!(model.connectivity().last_pull, Some(now));
    }

    #[test]
    fn test_messages_are_capped_and_deduplicated() {
        let mut model = model(&[]);
        let base = Utc::now();
        let msg = |i: i64| Message {
            timestamp: base + chrono::Duration::seconds(i),
            message_type: MessageType::Message,
            source: "coder".into(),
            content: format!("m{i}"),
        };
        model.push_message(msg(0));
        model.push_message(msg(0));
        assert_eq!(model.messages().count(), 1);

        for i in 1..5 {
            model.push_message(msg(i));
        }
        let contents: Vec<_> = model.messages().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_recovery_history_is_capped_but_stats_accumulate() {
        let mut model = model(&["a"]);
        for success in [false, false, true] {
            model.record_recovery(RecoveryAction {
                worker: "a".into(),
                issue: HealthIssueKind::Crashed,
                kind: RecoveryKind::Restart,
                timestamp: Utc::now(),
                success,
                error: None,
            });
        }
        assert_eq!(model.recovery_history().count(), 2);
        let stats = model.recovery_stats("a").unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[test]
    fn test_undeclaring_drops_override() {
        let now = Utc::now();
        let mut model = model(&["a"]);
        model.force_state(&WorkerName::new("a"), AgentState::Error, now);
        model.set_declared([]);
        model.set_declared([WorkerName::new("a")]);
        assert_eq!(model.status("a", now).unwrap().state, AgentState::Offline);
        assert!(model.forced.is_empty());
    }
}

//! Reconciliation plans: the diff between two configuration snapshots.

use crate::{ConfigSnapshot, WorkerName};
use serde::{Deserialize, Serialize};

/// Disjoint partition of worker names produced by diffing two snapshots.
///
/// Every name present in either snapshot lands in exactly one set. Each set is
/// sorted by name. Purely derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// Only in the new snapshot.
    pub to_start: Vec<WorkerName>,
    /// Only in the old snapshot.
    pub to_stop: Vec<WorkerName>,
    /// In both, with a different launch command, args, or env.
    pub to_restart: Vec<WorkerName>,
    /// In both, identical launch.
    pub unchanged: Vec<WorkerName>,
}

impl ReconciliationPlan {
    /// Diff `old` (the previously applied snapshot) against `new`.
    pub fn diff(old: &ConfigSnapshot, new: &ConfigSnapshot) -> Self {
        let mut plan = Self::default();

        for spec in old.workers() {
            match new.get(spec.name.as_str()) {
                None => plan.to_stop.push(spec.name.clone()),
                Some(next) if next.launch != spec.launch => {
                    plan.to_restart.push(spec.name.clone())
                }
                Some(_) => plan.unchanged.push(spec.name.clone()),
            }
        }

        plan.to_start = new
            .names()
            .filter(|name| !old.contains(name.as_str()))
            .cloned()
            .collect();

        plan
    }

    /// True when applying the plan would not touch any process.
    pub fn is_noop(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty() && self.to_restart.is_empty()
    }

    /// Number of workers the plan acts on.
    pub fn action_count(&self) -> usize {
        self.to_start.len() + self.to_stop.len() + self.to_restart.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoreSettings, LaunchSpec, WorkerSpec};
    use std::collections::{BTreeMap, BTreeSet};

    fn snapshot(workers: &[(&str, &str)]) -> ConfigSnapshot {
        ConfigSnapshot::new(
            workers
                .iter()
                .map(|(name, cmd)| WorkerSpec::new(*name, LaunchSpec::new(*cmd))),
            BTreeMap::new(),
            CoreSettings::default(),
        )
        .unwrap()
    }

    fn names(list: &[WorkerName]) -> Vec<&str> {
        list.iter().map(|n| n.as_str()).collect()
    }

    #[test]
    fn test_replace_one_worker() {
        let old = snapshot(&[("A", "cmd1"), ("B", "cmd2")]);
        let new = snapshot(&[("A", "cmd1"), ("C", "cmd3")]);

        let plan = ReconciliationPlan::diff(&old, &new);

        assert_eq!(names(&plan.to_stop), vec!["B"]);
        assert_eq!(names(&plan.to_start), vec!["C"]);
        assert!(plan.to_restart.is_empty());
        assert_eq!(names(&plan.unchanged), vec!["A"]);
        assert_eq!(plan.action_count(), 2);
    }

    #[test]
    fn test_changed_command_restarts() {
        let old = snapshot(&[("A", "cmd1")]);
        let new = snapshot(&[("A", "cmd1-v2")]);

        let plan = ReconciliationPlan::diff(&old, &new);
        assert_eq!(names(&plan.to_restart), vec!["A"]);
        assert!(plan.unchanged.is_empty());
    }

    #[test]
    fn test_env_change_restarts() {
        let old = snapshot(&[("A", "cmd1")]);
        let new = ConfigSnapshot::new(
            vec![WorkerSpec::new("A", LaunchSpec::new("cmd1").with_env("K", "v"))],
            BTreeMap::new(),
            CoreSettings::default(),
        )
        .unwrap();

        let plan = ReconciliationPlan::diff(&old, &new);
        assert_eq!(names(&plan.to_restart), vec!["A"]);
    }

    #[test]
    fn test_tag_change_alone_is_unchanged() {
        let old = snapshot(&[("A", "cmd1")]);
        let new = ConfigSnapshot::new(
            vec![WorkerSpec::new("A", LaunchSpec::new("cmd1")).with_phase("review")],
            BTreeMap::new(),
            CoreSettings::default(),
        )
        .unwrap();

        assert!(ReconciliationPlan::diff(&old, &new).is_noop());
    }

    #[test]
    fn test_from_empty_starts_everything() {
        let new = snapshot(&[("A", "cmd1"), ("B", "cmd2")]);
        let plan = ReconciliationPlan::diff(&ConfigSnapshot::empty(), &new);
        assert_eq!(names(&plan.to_start), vec!["A", "B"]);
        assert_eq!(plan.action_count(), 2);
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        // Every combination of presence/command over four names.
        let cmds = [None, Some("x"), Some("y")];
        let keys = ["a", "b", "c", "d"];
        let mut combos: Vec<Vec<(&str, &str)>> = vec![vec![]];
        for key in keys {
            let mut next = Vec::new();
            for combo in &combos {
                for cmd in cmds {
                    let mut c = combo.clone();
                    if let Some(cmd) = cmd {
                        c.push((key, cmd));
                    }
                    next.push(c);
                }
            }
            combos = next;
        }

        for old in &combos {
            for new in combos.iter().step_by(7) {
                let old_snap = snapshot(old);
                let new_snap = snapshot(new);
                let plan = ReconciliationPlan::diff(&old_snap, &new_snap);

                let all: Vec<&WorkerName> = plan
                    .to_start
                    .iter()
                    .chain(&plan.to_stop)
                    .chain(&plan.to_restart)
                    .chain(&plan.unchanged)
                    .collect();
                let unique: BTreeSet<&str> = all.iter().map(|n| n.as_str()).collect();
                let expected: BTreeSet<&str> =
                    old.iter().chain(new.iter()).map(|(n, _)| *n).collect();

                assert_eq!(all.len(), unique.len(), "sets overlap: {plan:?}");
                assert_eq!(unique, expected);

                let self_plan = ReconciliationPlan::diff(&new_snap, &new_snap);
                assert!(self_plan.is_noop());
                assert_eq!(self_plan.unchanged.len(), new_snap.len());
            }
        }
    }
}

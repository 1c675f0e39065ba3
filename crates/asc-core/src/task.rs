//! Tasks from the external task tracker.

use crate::WorkerName;
use serde::{Deserialize, Serialize};

/// A task as listed by the tracker. Read-only from the control plane's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    /// Tracker status string (open, in_progress, closed, ...).
    pub status: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl Task {
    /// Whether the task is assigned to the given worker.
    pub fn is_assigned_to(&self, worker: &WorkerName) -> bool {
        self.assignee.as_deref() == Some(worker.as_str())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "open" | "in_progress")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tracker_output() {
        let json = r#"[
            {"id":"bd-1","title":"Write parser","status":"open","phase":"implementation"},
            {"id":"bd-2","title":"Review parser","status":"in_progress","phase":"review","assignee":"reviewer"}
        ]"#;
        let tasks: Vec<Task> = serde_json::from_str(json).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].assignee.is_none());
        assert!(tasks[1].is_assigned_to(&WorkerName::new("reviewer")));
        assert!(tasks.iter().all(Task::is_open));
    }
}

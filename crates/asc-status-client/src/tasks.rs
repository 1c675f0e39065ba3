//! Pull-only task list from the beads tracker.

use asc_core::Task;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::ClientError;

/// A source of tasks that can only be polled.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Open and in-progress tasks.
    async fn list_tasks(&self) -> Result<Vec<Task>, ClientError>;
}

/// Runs the `bd` CLI inside the tracker's repository and parses its JSON output.
#[derive(Debug, Clone)]
pub struct BeadsClient {
    db_path: PathBuf,
    program: String,
    timeout: Duration,
}

impl BeadsClient {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            program: "bd".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Use a different executable in place of `bd`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Tasks whose status is one of `statuses`. All tasks when empty.
    pub async fn get_tasks(&self, statuses: &[&str]) -> Result<Vec<Task>, ClientError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--json").arg("list");
        if !statuses.is_empty() {
            cmd.arg("--status").arg(statuses.join(","));
        }
        if !self.db_path.as_os_str().is_empty() {
            cmd.current_dir(&self.db_path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, db_path = %self.db_path.display(), "Listing tasks");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ClientError::Command(format!("{} list timed out after {:?}", self.program, self.timeout))
            })?
            .map_err(|e| ClientError::Command(format!("{} list failed: {e}", self.program)))?;

        if !output.status.success() {
            return Err(ClientError::Command(format!(
                "{} list failed: {} (stderr: {})",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let tasks: Option<Vec<Task>> = serde_json::from_slice(&output.stdout)?;
        Ok(tasks.unwrap_or_default())
    }
}

#[async_trait]
impl TaskSource for BeadsClient {
    async fn list_tasks(&self) -> Result<Vec<Task>, ClientError> {
        self.get_tasks(&["open", "in_progress"]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_bd(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-bd");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_lists_tasks_from_cli_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_bd(
            dir.path(),
            r#"echo "$@" > args.txt
echo '[{"id":"bd-1","title":"Parser","status":"open","phase":"implementation"}]'"#,
        );

        let client = BeadsClient::new(dir.path()).with_program(program);
        let tasks = client.list_tasks().await.unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "bd-1");
        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "--json list --status open,in_progress");
    }

    #[tokio::test]
    async fn test_empty_output_is_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_bd(dir.path(), "exit 0");
        let client = BeadsClient::new(dir.path()).with_program(program);
        assert!(client.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_bd(dir.path(), "echo 'no beads database' >&2; exit 3");
        let client = BeadsClient::new(dir.path()).with_program(program);

        let err = client.list_tasks().await.unwrap_err();
        match err {
            ClientError::Command(msg) => assert!(msg.contains("no beads database"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let client = BeadsClient::new(dir.path()).with_program("definitely-not-bd-xyz");
        assert!(matches!(
            client.list_tasks().await,
            Err(ClientError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_bd(dir.path(), "sleep 5");
        let client = BeadsClient::new(dir.path())
            .with_program(program)
            .with_timeout(Duration::from_millis(100));

        match client.list_tasks().await {
            Err(ClientError::Command(msg)) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

//! Declared worker intent.

use crate::WorkerName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of process a worker is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// An AI agent that reports heartbeats to the relay.
    #[default]
    Agent,
    /// A supporting service (e.g. the message relay itself). Never reports heartbeats.
    Service,
}

/// The exact program invocation used to launch a worker.
///
/// Two workers are considered changed for reconciliation purposes iff their
/// `LaunchSpec`s differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Program to execute (looked up on PATH when not absolute).
    pub program: String,

    /// Argument vector, passed as-is with no shell interpretation.
    pub args: Vec<String>,

    /// Full environment for the child. Ordered so equality is stable.
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Create a launch spec with no arguments or environment.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Builder method to append an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder method to set an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Render the invocation for logs. Environment values are never included.
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Declared intent for one worker. Immutable once part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Unique key.
    pub name: WorkerName,

    pub kind: WorkerKind,

    /// How to launch it.
    pub launch: LaunchSpec,

    /// Model tag (claude, gemini, ...). Only used for matching against tasks.
    pub model: Option<String>,

    /// Phase tags. Only used for matching against tasks.
    pub phases: Vec<String>,
}

impl WorkerSpec {
    /// Create an agent worker spec.
    pub fn new(name: impl Into<WorkerName>, launch: LaunchSpec) -> Self {
        Self {
            name: name.into(),
            kind: WorkerKind::Agent,
            launch,
            model: None,
            phases: Vec::new(),
        }
    }

    /// Builder method to mark this worker as a service.
    pub fn service(mut self) -> Self {
        self.kind = WorkerKind::Service;
        self
    }

    /// Builder method to set the model tag.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder method to add a phase tag.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phases.push(phase.into());
        self
    }

    /// Whether this worker is expected to report status to the relay.
    pub fn reports_status(&self) -> bool {
        self.kind == WorkerKind::Agent
    }

    /// Whether the worker handles a given phase.
    pub fn handles_phase(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p.eq_ignore_ascii_case(phase))
    }
}

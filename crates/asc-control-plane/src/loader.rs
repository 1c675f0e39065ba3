//! Parse `asc.toml` and the secrets file into a validated [`ConfigSnapshot`].
//!
//! ```toml
//! [core]
//! beads_db_path = "./project-repo"
//! auto_recovery = true
//!
//! [services.mcp_agent_mail]
//! start_command = "python -m mcp_agent_mail.server"
//! url = "http://localhost:8765"
//!
//! [agent.planner]
//! command = "python agent_adapter.py"
//! model = "claude"
//! phases = ["planning", "design"]
//! env = { LOG_LEVEL = "debug" }
//! ```

use asc_core::snapshot::{DEFAULT_BEADS_DB_PATH, DEFAULT_RELAY_URL};
use asc_core::{ConfigError, ConfigSnapshot, CoreSettings, LaunchSpec, WorkerSpec};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::{expand_home, ControlPlaneOverrides};

/// Worker name given to the managed relay service.
pub const RELAY_SERVICE_NAME: &str = "mcp_agent_mail";

pub const VALID_MODELS: &[&str] = &["claude", "gemini", "gpt-4", "codex", "openai"];

pub const VALID_PHASES: &[&str] = &[
    "planning",
    "design",
    "implementation",
    "coding",
    "testing",
    "review",
    "refactor",
    "documentation",
    "debugging",
    "optimization",
    "deployment",
];

/// At least one of these is expected in the secrets file.
pub const API_KEY_NAMES: &[&str] = &["CLAUDE_API_KEY", "OPENAI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    core: CoreSection,
    #[serde(default)]
    services: ServicesSection,
    #[serde(default)]
    agent: BTreeMap<String, AgentSection>,
    #[serde(default)]
    control_plane: ControlPlaneOverrides,
}

#[derive(Debug, Default, Deserialize)]
struct CoreSection {
    beads_db_path: Option<String>,
    auto_recovery: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesSection {
    #[serde(default)]
    mcp_agent_mail: RelaySection,
}

#[derive(Debug, Default, Deserialize)]
struct RelaySection {
    start_command: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    phases: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Everything read from the config file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub snapshot: ConfigSnapshot,
    pub overrides: ControlPlaneOverrides,
}

/// Re-read both files for a hot reload.
///
/// `[control_plane]` values are fixed at startup. Edits to them are logged as
/// ignored and the worker sections are applied as usual.
pub fn reload_snapshot(
    config_path: &Path,
    env_path: &Path,
    running: &ControlPlaneOverrides,
) -> Result<ConfigSnapshot, ConfigError> {
    let loaded = load(config_path, env_path)?;
    let ignored = loaded.overrides.changed_from(running);
    if !ignored.is_empty() {
        warn!(
            settings = ?ignored,
            "[control_plane] settings changed, they take effect after a restart"
        );
    }
    Ok(loaded.snapshot)
}

/// Read both files and build a snapshot.
pub fn load_snapshot(config_path: &Path, env_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    load(config_path, env_path).map(|loaded| loaded.snapshot)
}

/// Read both files, returning the snapshot and any control plane tuning.
pub fn load(config_path: &Path, env_path: &Path) -> Result<LoadedConfig, ConfigError> {
    let label = config_path.display().to_string();
    let contents = std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
        path: label.clone(),
        message: e.to_string(),
    })?;
    let secrets = load_env_file(env_path)?;
    parse(&contents, &label, secrets)
}

/// Read a KEY=VALUE secrets file. A missing file yields an empty map.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let label = path.display().to_string();
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => {
            warn!(path = %label, "Env file not found, continuing without secrets");
            return Ok(BTreeMap::new());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: label,
                message: e.to_string(),
            })
        }
    };

    let mut secrets = BTreeMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| ConfigError::Parse {
            path: label.clone(),
            message: e.to_string(),
        })?;
        secrets.insert(key, value);
    }

    let has_key = API_KEY_NAMES
        .iter()
        .any(|k| secrets.contains_key(*k) || std::env::var_os(k).is_some());
    if !has_key {
        warn!(
            path = %label,
            expected = %API_KEY_NAMES.join(", "),
            "No API keys found; agents may fail to authenticate"
        );
    }

    debug!(path = %label, count = secrets.len(), "Loaded secrets");
    Ok(secrets)
}

/// Parse config file contents. `label` names the source in errors.
pub fn parse(
    contents: &str,
    label: &str,
    secrets: BTreeMap<String, String>,
) -> Result<LoadedConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: label.to_string(),
        message: e.message().to_string(),
    })?;

    if file.agent.is_empty() {
        return Err(ConfigError::NoWorkers);
    }

    let mut seen: HashMap<String, &str> = HashMap::new();
    for name in file.agent.keys() {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("agent name must not be empty".into()));
        }
        if let Some(existing) = seen.insert(name.to_lowercase(), name) {
            return Err(ConfigError::Invalid(format!(
                "duplicate agent name: '{existing}' and '{name}' (names are case-insensitive)"
            )));
        }
    }

    let relay_url = file
        .services
        .mcp_agent_mail
        .url
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
    let settings = CoreSettings {
        beads_db_path: expand_home(
            file.core
                .beads_db_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(DEFAULT_BEADS_DB_PATH),
        ),
        auto_recovery: file.core.auto_recovery.unwrap_or(true),
        relay_url,
    };

    let mut workers = Vec::with_capacity(file.agent.len() + 1);

    if let Some(command) = file
        .services
        .mcp_agent_mail
        .start_command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        let mut launch = split_command(RELAY_SERVICE_NAME, command)?;
        launch.env = secrets.clone();
        workers.push(WorkerSpec::new(RELAY_SERVICE_NAME, launch).service());
    }

    for (name, section) in &file.agent {
        workers.push(build_agent(name, section, &settings, &secrets)?);
    }

    let snapshot = ConfigSnapshot::new(workers, secrets, settings)?;
    Ok(LoadedConfig {
        snapshot,
        overrides: file.control_plane,
    })
}

fn build_agent(
    name: &str,
    section: &AgentSection,
    settings: &CoreSettings,
    secrets: &BTreeMap<String, String>,
) -> Result<WorkerSpec, ConfigError> {
    if section.command.trim().is_empty() {
        return Err(ConfigError::MissingField {
            agent: name.to_string(),
            field: "command".into(),
        });
    }
    if section.model.trim().is_empty() {
        return Err(ConfigError::MissingField {
            agent: name.to_string(),
            field: "model".into(),
        });
    }
    let model = section.model.to_lowercase();
    if !VALID_MODELS.contains(&model.as_str()) {
        return Err(ConfigError::InvalidModel {
            agent: name.to_string(),
            model: section.model.clone(),
            valid: VALID_MODELS.join(", "),
        });
    }
    if section.phases.is_empty() {
        return Err(ConfigError::MissingField {
            agent: name.to_string(),
            field: "phases".into(),
        });
    }
    let mut phases = Vec::with_capacity(section.phases.len());
    for phase in &section.phases {
        let lower = phase.to_lowercase();
        if !VALID_PHASES.contains(&lower.as_str()) {
            return Err(ConfigError::InvalidPhase {
                agent: name.to_string(),
                phase: phase.clone(),
                suggestion: suggest_phase(&lower).map(str::to_string),
            });
        }
        phases.push(lower);
    }

    let mut launch = split_command(name, &section.command)?;
    launch.args.extend(section.args.iter().cloned());

    let mut env = secrets.clone();
    env.insert("AGENT_NAME".into(), name.to_string());
    env.insert("AGENT_MODEL".into(), model.clone());
    env.insert("AGENT_PHASES".into(), phases.join(","));
    env.insert("MCP_MAIL_URL".into(), settings.relay_url.clone());
    env.insert(
        "BEADS_DB_PATH".into(),
        settings.beads_db_path.display().to_string(),
    );
    env.extend(section.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    launch.env = env;

    let mut spec = WorkerSpec::new(name, launch).with_model(model);
    spec.phases = phases;
    Ok(spec)
}

/// Split a command line into program and argv without invoking a shell.
fn split_command(name: &str, command: &str) -> Result<LaunchSpec, ConfigError> {
    let parts = shlex::split(command).ok_or_else(|| {
        ConfigError::Invalid(format!("'{name}': command has unbalanced quotes: {command}"))
    })?;
    let mut parts = parts.into_iter();
    let program = parts.next().ok_or_else(|| ConfigError::MissingField {
        agent: name.to_string(),
        field: "command".into(),
    })?;
    Ok(LaunchSpec {
        program,
        args: parts.collect(),
        env: BTreeMap::new(),
    })
}

/// Closest valid phase for a typo: substring match first, then common abbreviations.
fn suggest_phase(input: &str) -> Option<&'static str> {
    if input.is_empty() {
        return None;
    }
    if let Some(phase) = VALID_PHASES
        .iter()
        .copied()
        .find(|valid| valid.contains(input) || input.contains(valid))
    {
        return Some(phase);
    }
    match input {
        "plan" => Some("planning"),
        "impl" => Some("implementation"),
        "code" => Some("coding"),
        "test" => Some("testing"),
        "doc" | "docs" => Some("documentation"),
        "debug" => Some("debugging"),
        "opt" => Some("optimization"),
        "deploy" => Some("deployment"),
        "refact" => Some("refactor"),
        _ => None,
    }
}

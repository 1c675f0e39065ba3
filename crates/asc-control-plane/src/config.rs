//! Control plane configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Control plane runtime settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Declared stack configuration (TOML).
    pub config_path: PathBuf,

    /// Secrets file (KEY=VALUE lines).
    pub env_path: PathBuf,

    /// Directory for per-worker log files.
    pub logs_dir: PathBuf,

    /// Hot-reload the config file when it changes.
    pub watch_config: bool,

    /// Health check tick (seconds).
    pub health_check_interval_secs: u64,

    /// Silence after which an agent is considered offline (seconds).
    pub offline_threshold_secs: u64,

    /// Time on one task after which a working agent is considered stuck (seconds).
    pub stuck_threshold_secs: u64,

    /// Minimum time between automatic restarts of the same worker (seconds).
    pub recovery_cooldown_secs: u64,

    /// Cap on the extra delay added after consecutive failed recoveries (seconds).
    pub max_recovery_backoff_secs: u64,

    /// Pull-mode polling interval (seconds).
    pub poll_interval_secs: u64,

    /// Relay request timeout (seconds).
    pub request_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL (seconds).
    pub stop_grace_secs: u64,

    /// Quiet period before a config change is loaded (milliseconds).
    pub debounce_ms: u64,

    /// How often the config file is checked for changes (milliseconds).
    pub watch_poll_ms: u64,

    /// Capacity of each coordinator mailbox.
    pub mailbox_capacity: usize,

    /// Messages kept for readers.
    pub message_history: usize,

    /// Recovery actions kept for readers.
    pub recovery_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("asc.toml"),
            env_path: PathBuf::from(".env"),
            logs_dir: default_logs_dir(),
            watch_config: true,
            health_check_interval_secs: 30,
            offline_threshold_secs: 120,
            stuck_threshold_secs: 30 * 60,
            recovery_cooldown_secs: 60,
            max_recovery_backoff_secs: 15 * 60,
            poll_interval_secs: 5,
            request_timeout_secs: 10,
            stop_grace_secs: 5,
            debounce_ms: 500,
            watch_poll_ms: 250,
            mailbox_capacity: 64,
            message_history: 100,
            recovery_history: 100,
        }
    }
}

impl Config {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }

    pub fn max_recovery_backoff(&self) -> Duration {
        Duration::from_secs(self.max_recovery_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }

    /// Apply a `[control_plane]` section from the config file. Zero values are ignored.
    pub fn apply_overrides(&mut self, overrides: &ControlPlaneOverrides) {
        fn set(target: &mut u64, value: Option<u64>) {
            if let Some(v) = value.filter(|v| *v > 0) {
                *target = v;
            }
        }
        set(&mut self.health_check_interval_secs, overrides.health_check_interval_secs);
        set(&mut self.offline_threshold_secs, overrides.offline_threshold_secs);
        set(&mut self.stuck_threshold_secs, overrides.stuck_threshold_secs);
        set(&mut self.recovery_cooldown_secs, overrides.recovery_cooldown_secs);
        set(&mut self.poll_interval_secs, overrides.poll_interval_secs);
        set(&mut self.stop_grace_secs, overrides.stop_grace_secs);
        set(&mut self.debounce_ms, overrides.debounce_ms);
        if let Some(dir) = &overrides.logs_dir {
            self.logs_dir = expand_home(dir);
        }
    }
}

/// Optional tuning read from the `[control_plane]` table of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlPlaneOverrides {
    pub logs_dir: Option<String>,
    pub health_check_interval_secs: Option<u64>,
    pub offline_threshold_secs: Option<u64>,
    pub stuck_threshold_secs: Option<u64>,
    pub recovery_cooldown_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
    pub debounce_ms: Option<u64>,
}

impl ControlPlaneOverrides {
    /// Keys whose value differs from `other`.
    pub fn changed_from(&self, other: &Self) -> Vec<&'static str> {
        [
            ("logs_dir", self.logs_dir != other.logs_dir),
            (
                "health_check_interval_secs",
                self.health_check_interval_secs != other.health_check_interval_secs,
            ),
            ("offline_threshold_secs", self.offline_threshold_secs != other.offline_threshold_secs),
            ("stuck_threshold_secs", self.stuck_threshold_secs != other.stuck_threshold_secs),
            ("recovery_cooldown_secs", self.recovery_cooldown_secs != other.recovery_cooldown_secs),
            ("poll_interval_secs", self.poll_interval_secs != other.poll_interval_secs),
            ("stop_grace_secs", self.stop_grace_secs != other.stop_grace_secs),
            ("debounce_ms", self.debounce_ms != other.debounce_ms),
        ]
        .into_iter()
        .filter_map(|(key, changed)| changed.then_some(key))
        .collect()
    }
}

/// `~/.asc/logs`, or `./.asc/logs` when `$HOME` is unset.
pub fn default_logs_dir() -> PathBuf {
    expand_home("~/.asc/logs")
}

/// Expand a leading `~` using `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        (Some(rest), None) => PathBuf::from(".").join(rest.trim_start_matches('/')),
        (None, _) => PathBuf::from(path),
    }
}

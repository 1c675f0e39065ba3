//! Agent Stack Control Plane
//!
//! Starts every declared agent, keeps them running, and stops them all on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use asc_control_plane::loader;
use asc_control_plane::{Config, ControlPlane, ControlPlaneError, ProcessSupervisor, SnapshotLoader};
use asc_status_client::{
    BeadsClient, HttpClientConfig, HttpStatusClient, PushConfig, PushStatusClient, StatusSource,
    TaskSource,
};

/// Agent stack control plane.
#[derive(Parser, Debug)]
#[command(name = "asc-control-plane", about = "Supervise and monitor an agent stack")]
struct Args {
    /// Stack configuration file
    #[arg(long, default_value = "asc.toml")]
    config: PathBuf,

    /// Secrets file (KEY=VALUE lines)
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Directory for worker logs (default ~/.asc/logs)
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Do not reload the configuration when it changes
    #[arg(long)]
    no_watch: bool,

    /// Poll the relay instead of holding an event stream open
    #[arg(long)]
    no_push: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "asc_control_plane={level},asc_status_client={level},asc_core={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config = %args.config.display(), "Agent stack control plane starting");

    let loaded = loader::load(&args.config, &args.env_file)?;
    let mut config = Config {
        config_path: args.config.clone(),
        env_path: args.env_file.clone(),
        watch_config: !args.no_watch,
        ..Config::default()
    };
    config.apply_overrides(&loaded.overrides);
    if let Some(dir) = args.logs_dir {
        config.logs_dir = dir;
    }

    let supervisor = ProcessSupervisor::new(&config.logs_dir, config.stop_grace()).map_err(|e| {
        ControlPlaneError::Startup(format!(
            "cannot create logs directory {}: {}",
            config.logs_dir.display(),
            e
        ))
    })?;

    let settings = loaded.snapshot.settings().clone();
    let pull = HttpStatusClient::with_config(
        &settings.relay_url,
        HttpClientConfig {
            request_timeout: config.request_timeout(),
            ..HttpClientConfig::default()
        },
    )?;
    let source: Arc<dyn StatusSource> = if args.no_push {
        Arc::new(pull)
    } else {
        Arc::new(PushStatusClient::new(pull, PushConfig::default())?)
    };
    let tasks: Arc<dyn TaskSource> = Arc::new(BeadsClient::new(settings.beads_db_path.clone()));

    let reload: SnapshotLoader = {
        let (config_path, env_path) = (args.config, args.env_file);
        let running = loaded.overrides;
        Arc::new(move || loader::reload_snapshot(&config_path, &env_path, &running))
    };

    let handle = ControlPlane::new(config, Arc::new(supervisor), source, Some(tasks))
        .start(loaded.snapshot, Some(reload))
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    handle.shutdown().await?;
    Ok(())
}

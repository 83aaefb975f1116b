/// agentd-daemon entry point: loads configuration, wires the core
/// supervisor stack to the REST API, and runs until SIGTERM/ctrl-c.
use agentd_core::{AgentController, AgentdCoreConfig, ProcessSupervisor, Store, SupervisorEventLoop};
use agentd_daemon::api::AppState;
use agentd_daemon::auth::AuthManager;
use agentd_daemon::config::DaemonConfig;
use agentd_daemon::metrics::MetricsCollector;
use agentd_daemon::server::Daemon;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "agentd-daemon",
    about = "REST daemon for supervising multi-tenant agent processes",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(short, long, value_name = "PORT", help = "HTTP server port (default: 8080)")]
    port: Option<u16>,

    #[arg(long, value_name = "PATH", help = "Path to the SQLite database file")]
    database_path: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Path to the agentd-worker binary")]
    worker_binary: Option<PathBuf>,

    #[arg(short, long, value_name = "LEVEL", default_value = "info", help = "Log level (trace, debug, info, warn, error)")]
    log_level: String,

    #[arg(short, long, help = "Enable verbose (debug) output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .with_target(false)
        .with_line_number(true)
        .init();

    info!("starting agentd-daemon v{}", agentd_daemon::VERSION);

    let mut daemon_config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "loading daemon configuration");
            DaemonConfig::load(path.to_str().unwrap())?
        }
        None => DaemonConfig::default(),
    };
    daemon_config.apply_env_overrides();
    if let Some(port) = args.port {
        daemon_config.server.port = port;
    }
    daemon_config.validate()?;

    let mut core_config = AgentdCoreConfig::default();
    core_config.apply_env_overrides();
    if let Some(path) = args.database_path {
        core_config.database_path = path;
    }
    if let Some(path) = args.worker_binary {
        core_config.worker_binary = path;
    }
    core_config.validate().map_err(anyhow::Error::msg)?;

    let store = Arc::new(Store::connect(&core_config.database_path).await?);
    let (supervisor, events_rx) = ProcessSupervisor::new(core_config.worker_binary.clone());
    let supervisor = Arc::new(supervisor);
    let controller = Arc::new(AgentController::new(
        store.clone(),
        supervisor.clone(),
        core_config.clone(),
    ));
    let event_loop = Arc::new(SupervisorEventLoop::new(
        store.clone(),
        controller.clone(),
        supervisor.clone(),
        core_config.clone(),
    ));

    let auth = Arc::new(AuthManager::new(daemon_config.auth.clone()));
    let metrics = Arc::new(MetricsCollector::new()?);

    let state = Arc::new(AppState {
        store: store.clone(),
        controller: controller.clone(),
        supervisor,
        auth,
        metrics,
        version: agentd_daemon::VERSION.to_string(),
        started_at: std::time::Instant::now(),
        shutting_down: AtomicBool::new(false),
    });

    let daemon = Daemon {
        state,
        store,
        controller,
        core_config,
        daemon_config,
    };

    daemon.run(event_loop, events_rx).await?;
    info!("agentd-daemon stopped");
    Ok(())
}

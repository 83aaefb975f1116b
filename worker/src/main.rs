/// agentd-worker: the generic child process the supervisor spawns for every
/// running agent. It reads its identity and effective configuration from the
/// environment the supervisor sets, serves a tiny control-plane HTTP API on
/// `AGENT_PORT`, and reports liveness/metrics on stdout as NDJSON lines the
/// supervisor's stream parser understands.
use agentd_core::AgentConfigDocument;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::env;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{get_current_pid, ProcessRefreshKind, RefreshKind, System};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_GRACE_TIMEOUT_MS: u64 = 10_000;
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "agentd-worker", about = "generic worker process supervised by agentd-daemon")]
struct Args {
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

struct AppState {
    agent_id: String,
    agent_name: String,
    config: AgentConfigDocument,
    draining: AtomicBool,
    shutdown: Notify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(args.log_level.parse()?))
        .with_target(false)
        .init();

    let agent_id = env::var("AGENT_ID").unwrap_or_else(|_| "unknown".to_string());
    let agent_name = env::var("AGENT_NAME").unwrap_or_else(|_| "unknown".to_string());
    let port: u16 = env::var("AGENT_PORT")
        .map_err(|_| anyhow::anyhow!("AGENT_PORT must be set by the supervisor"))?
        .parse()?;
    let config: AgentConfigDocument = match env::var("AGENT_CONFIG") {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => AgentConfigDocument::default(),
    };

    let heartbeat_interval_ms: u64 = env::var("HEARTBEAT_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
    let grace_timeout_ms: u64 = env::var("GRACE_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_GRACE_TIMEOUT_MS);

    let state = Arc::new(AppState {
        agent_id: agent_id.clone(),
        agent_name,
        config,
        draining: AtomicBool::new(false),
        shutdown: Notify::new(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/process", post(process))
        .route("/shutdown", post(shutdown_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    emit_record(&json!({"type": "ready"}));
    info!(%agent_id, port, "agentd-worker listening");

    let heartbeat_handle = tokio::spawn(heartbeat_loop(heartbeat_interval_ms));
    let metrics_handle = tokio::spawn(metrics_loop());

    let sigterm = wait_for_sigterm(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(sigterm)
        .await?;

    heartbeat_handle.abort();
    metrics_handle.abort();

    // Give any in-flight handler a moment to finish past the graceful-shutdown
    // signal before the process actually exits.
    tokio::time::sleep(Duration::from_millis(grace_timeout_ms.min(200))).await;
    info!("agentd-worker exiting cleanly");
    Ok(())
}

fn emit_record(value: &Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

async fn heartbeat_loop(interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        emit_record(&json!({"type": "heartbeat"}));
    }
}

async fn metrics_loop() {
    let mut system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    let pid = get_current_pid().expect("couldn't resolve the worker's own pid");
    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    loop {
        ticker.tick().await;
        system.refresh_process(pid);
        let (rss_bytes, cpu_user) = match system.process(pid) {
            Some(proc) => (proc.memory() as i64, proc.cpu_usage() as f64),
            None => (0, 0.0),
        };
        emit_record(&json!({
            "type": "metrics",
            "rss_bytes": rss_bytes,
            "heap_total_bytes": 0,
            "heap_used_bytes": 0,
            "cpu_user": cpu_user,
            "cpu_system": 0.0,
        }));
    }
}

async fn wait_for_sigterm(state: Arc<AppState>) {
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = terminate => {
            info!("received SIGTERM, draining in-flight requests");
            state.draining.store(true, Ordering::SeqCst);
        }
        _ = state.shutdown.notified() => {
            info!("shutdown requested over HTTP, draining in-flight requests");
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let draining = state.draining.load(Ordering::SeqCst);
    Json(json!({
        "status": if draining { "draining" } else { "ok" },
        "agent_id": state.agent_id,
        "agent_name": state.agent_name,
    }))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<AgentConfigDocument> {
    Json(state.config.clone())
}

async fn process(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Json<Value> {
    if state.draining.load(Ordering::SeqCst) {
        return Json(json!({"status": "rejected", "reason": "worker is draining"}));
    }
    Json(json!({
        "status": "ok",
        "agent_id": state.agent_id,
        "echo": body,
    }))
}

async fn shutdown_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.draining.store(true, Ordering::SeqCst);
    state.shutdown.notify_one();
    warn!(agent_id = %state.agent_id, "shutdown requested via /shutdown");
    Json(json!({"status": "shutting-down"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            agent_id: "agent-1".to_string(),
            agent_name: "demo".to_string(),
            config: AgentConfigDocument::default(),
            draining: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    #[tokio::test]
    async fn health_reports_ok_until_draining() {
        let state = test_state();
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["status"], "ok");

        state.draining.store(true, Ordering::SeqCst);
        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "draining");
    }

    #[tokio::test]
    async fn process_rejects_once_draining() {
        let state = test_state();
        let Json(body) = process(State(state.clone()), Json(json!({"input": 1}))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["echo"]["input"], 1);

        state.draining.store(true, Ordering::SeqCst);
        let Json(body) = process(State(state), Json(json!({"input": 2}))).await;
        assert_eq!(body["status"], "rejected");
    }

    #[tokio::test]
    async fn shutdown_marks_draining_and_notifies() {
        let state = test_state();
        let Json(body) = shutdown_handler(State(state.clone())).await;
        assert_eq!(body["status"], "shutting-down");
        assert!(state.draining.load(Ordering::SeqCst));
    }
}

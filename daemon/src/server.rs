/// Builds the axum router and owns the daemon's background tasks: the
/// request-serving `TcpListener` accept loop, `HealthMonitor::run`,
/// `SupervisorEventLoop::run`, and the `§5` graceful-shutdown sequence.
///
/// Grounded in the teacher's `main.rs` `tokio::select!` over `ctrl_c`/
/// `SIGTERM`, extended with the spec's explicit shutdown contract: reject
/// new start/restart intents, `stop(force=false)` every running agent, wait,
/// escalate to `stop(force=true)` past the configured deadline, then exit.
use crate::api::{router, AppState};
use crate::config::DaemonConfig;
use agentd_core::{AgentController, AgentStatus, AgentdCoreConfig, HealthMonitor, Principal, Role, Store, SupervisorEvent, SupervisorEventLoop};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct Daemon {
    pub state: Arc<AppState>,
    pub store: Arc<Store>,
    pub controller: Arc<AgentController>,
    pub core_config: AgentdCoreConfig,
    pub daemon_config: DaemonConfig,
}

impl Daemon {
    pub async fn run(
        self,
        event_loop: Arc<SupervisorEventLoop>,
        events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> anyhow::Result<()> {
        let cors = if self.daemon_config.server.cors_origin == "*" {
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
        } else {
            let origin: axum::http::HeaderValue = self.daemon_config.server.cors_origin.parse()?;
            CorsLayer::new().allow_origin(origin)
        };

        let app = router(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        let addr = format!(
            "{}:{}",
            self.daemon_config.server.bind_addr, self.daemon_config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "agentd-daemon listening");

        let (health_shutdown_tx, health_shutdown_rx) = watch::channel(false);
        let health_monitor = HealthMonitor::new(
            self.store.clone(),
            self.controller.clone(),
            &self.core_config,
        );
        let health_handle = tokio::spawn(async move {
            health_monitor.run(health_shutdown_rx).await;
        });
        let events_handle = tokio::spawn(event_loop.run(events_rx));

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_shutdown_signal())
                .await
        });

        server_handle.await??;
        tracing::info!("signal received, draining running agents");

        self.state.shutting_down.store(true, Ordering::SeqCst);
        self.drain_running_agents().await;

        let _ = health_shutdown_tx.send(true);
        let _ = health_handle.await;
        events_handle.abort();

        tracing::info!("agentd-daemon stopped");
        Ok(())
    }

    /// `stop(force=false)` every running agent, then escalate any still not
    /// `stopped` to `stop(force=true)` once `shutdown_deadline` elapses.
    async fn drain_running_agents(&self) {
        let admin = Principal {
            user_id: uuid::Uuid::nil(),
            role: Role::Admin,
        };
        let running = match self
            .store
            .list_agents(&agentd_core::AgentListQuery {
                status: Some(AgentStatus::Running),
                limit: u32::MAX,
                ..Default::default()
            })
            .await
        {
            Ok(agents) => agents,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list running agents during shutdown");
                return;
            }
        };

        let deadline = self.core_config.shutdown_deadline();
        for agent in running {
            let controller = self.controller.clone();
            let id = agent.id;
            let result = tokio::time::timeout(deadline, async move {
                controller.stop(&admin, id, false).await
            })
            .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(agent_id = %id, error = %e, "graceful stop failed"),
                Err(_) => {
                    tracing::warn!(agent_id = %id, "graceful stop deadline exceeded, forcing kill");
                    if let Err(e) = self.controller.stop(&admin, id, true).await {
                        tracing::warn!(agent_id = %id, error = %e, "forced stop failed");
                    }
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

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
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

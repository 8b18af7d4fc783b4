use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use careassist_common::{Error, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::{AppState, SharedState};

/// Serves the chat API and runs the idempotency purge loop.
pub struct GatewayServer {
    state: SharedState,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Bind to the configured host and port and serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.gateway.host, self.state.config.gateway.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        let purge = spawn_purge_task(self.state.clone());
        let app = build_router(self.state.clone());

        info!("careassist gateway listening on {local}");
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        purge.abort();
        info!("careassist gateway stopped");
        result.map_err(Error::Io)
    }
}

fn spawn_purge_task(state: SharedState) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(state.config.idempotency.purge_interval_secs.max(1));
    let retention = state.idempotency_retention();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = state.records.purge_expired(retention) {
                warn!("idempotency purge failed: {e}");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

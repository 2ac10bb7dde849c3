use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use tokio::{net::TcpListener, select, sync::oneshot, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    hub::{Hub, HubConfig, HubHandle, HubStats, read_loop},
    transport,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub hub: HubConfig,
    /// Upper bound on closing clients, and separately on stopping the HTTP
    /// server, once shutdown starts.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            hub: HubConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, config } = self;
        let (hub, _event_loop) = Hub::spawn(config.hub.clone());
        let app = router(hub.clone());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut http = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        tokio::pin!(shutdown);
        select! {
            _ = &mut shutdown => {}
            result = &mut http => {
                hub.shutdown(config.shutdown_timeout).await;
                return result
                    .context("http server task panicked")?
                    .context("http server failed");
            }
        }

        info!("relay shutting down");
        let report = hub.shutdown(config.shutdown_timeout).await;
        info!(
            closed = report.closed,
            abandoned = report.abandoned,
            "clients disconnected"
        );

        let _ = stop_tx.send(());
        match timeout(config.shutdown_timeout, http).await {
            Ok(result) => result
                .context("http server task panicked")?
                .context("http server failed")?,
            Err(_) => warn!("http server did not stop before the shutdown timeout"),
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn upgrade(State(hub): State<HubHandle>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(hub, socket))
}

async fn stats(State(hub): State<HubHandle>) -> Json<HubStats> {
    Json(hub.stats().await)
}

async fn serve_socket(hub: HubHandle, socket: WebSocket) {
    let connection = Arc::new(transport::websocket(socket));
    let id = connection.id();

    if let Err(error) = hub.register(Arc::clone(&connection)) {
        debug!(connection = %id, %error, "rejected client");
        return;
    }

    info!(connection = %id, "client connected");
    read_loop(hub, connection).await;
    info!(connection = %id, "client disconnected");
}

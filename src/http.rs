use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    auth::{self, OAuthServer},
    backend::SessionFactory,
    error::{Error, Result},
    mcp::{self, McpState},
    schema::Implementation,
    session::SessionCache,
    tools::Toolbox,
};

/// How often expired grants are purged.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The HTTP server: OAuth endpoints plus the protected MCP endpoint.
pub struct Server<F: SessionFactory> {
    oauth: Arc<OAuthServer>,
    sessions: Arc<SessionCache<F>>,
    tools: Arc<dyn Toolbox<F::Session>>,
    public_url: Option<String>,
    sweep_interval: Duration,
    server_info: Implementation,
}

impl<F: SessionFactory> Server<F> {
    pub fn new<T>(oauth: OAuthServer, factory: Arc<F>, tools: T) -> Self
    where
        T: Toolbox<F::Session>,
    {
        Self {
            oauth: Arc::new(oauth),
            sessions: Arc::new(SessionCache::new(factory)),
            tools: Arc::new(tools),
            public_url: None,
            sweep_interval: SWEEP_INTERVAL,
            server_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
                .with_title("Things Cloud MCP"),
        }
    }

    /// Fixes the externally visible base URL instead of deriving it from
    /// request headers.
    pub fn with_public_url(mut self, public_url: Option<String>) -> Self {
        self.public_url = public_url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn oauth(&self) -> &Arc<OAuthServer> {
        &self.oauth
    }

    pub fn sessions(&self) -> &Arc<SessionCache<F>> {
        &self.sessions
    }

    pub fn router(&self) -> Router {
        let mcp_state = McpState {
            bridge: self.oauth.bridge(),
            sessions: self.sessions.clone(),
            tools: self.tools.clone(),
            public_url: self.public_url.as_deref().map(Arc::from),
            server_info: self.server_info.clone(),
        };

        auth::routes(self.oauth.clone(), self.public_url.clone())
            .merge(mcp::routes(mcp_state))
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Binds `addr` and serves until the returned handle is stopped.
    pub async fn serve_http(self, addr: impl AsRef<str>) -> Result<ServerHandle> {
        let addr = addr.as_ref();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {addr}: {e}")))?;

        // The actual address, in case port 0 was used
        let bound_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local address: {e}")))?;

        let router = self.router();
        let shutdown_token = CancellationToken::new();

        let sweeper = spawn_sweeper(
            self.oauth.clone(),
            self.sweep_interval,
            shutdown_token.clone(),
        );

        let shutdown = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            info!("HTTP server listening on {}", bound_addr);
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                })
                .await
                .map_err(|e| Error::Transport(format!("Server error: {e}")))
        });

        Ok(ServerHandle {
            handle,
            sweeper,
            shutdown_token,
            bound_addr,
        })
    }
}

fn spawn_sweeper(
    oauth: Arc<OAuthServer>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match oauth.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!("Purged {} expired grants", n),
                    Err(e) => warn!("Grant sweep failed: {}", e),
                },
            }
        }
    })
}

pub struct ServerHandle {
    pub handle: JoinHandle<Result<()>>,
    sweeper: JoinHandle<()>,
    shutdown_token: CancellationToken,
    pub bound_addr: SocketAddr,
}

impl ServerHandle {
    /// `http://<bound address>`
    pub fn url(&self) -> String {
        format!("http://{}", self.bound_addr)
    }

    /// A token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Waits for the server to exit on its own (after the shutdown token
    /// is cancelled elsewhere).
    pub async fn wait(self) -> Result<()> {
        let result = self
            .handle
            .await
            .map_err(|e| Error::InternalError(format!("Server task failed: {e}")))?;
        self.shutdown_token.cancel();
        let _ = self.sweeper.await;
        result
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown_token.cancel();
        self.wait().await
    }
}

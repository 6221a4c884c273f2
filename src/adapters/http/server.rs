//! HTTP server wrapping the scheduler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::routes::{router, AppState};
use crate::domain::models::ServerConfig;
use crate::services::Scheduler;

/// Full application router with tracing and, when enabled, permissive CORS.
pub fn build_app(scheduler: Arc<Scheduler>, enable_cors: bool) -> Router {
    let app = router(AppState::new(scheduler));
    if enable_cors {
        app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
    } else {
        app.layer(TraceLayer::new_for_http())
    }
}

pub struct HttpServer {
    config: ServerConfig,
    scheduler: Arc<Scheduler>,
}

impl HttpServer {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            config: scheduler.config().server.clone(),
            scheduler,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.config.host, self.config.port).parse()
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self
            .addr()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, cors = self.config.enable_cors, "taskmesh HTTP server listening");

        let app = build_app(self.scheduler, self.config.enable_cors);
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await
    }
}

//! HTTP ingest adapter
//!
//! Accepts alert drafts over HTTP and hands them to an [`AlertSink`]: the
//! node's publisher or a relay. Optionally exposes the audit log read-only.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fraudnet_federation::{AlertSink, AuditLog, PublishError};
use fraudnet_protocol::AlertDraft;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Shared handler state
pub struct AppState {
    pub sink: Arc<dyn AlertSink>,
    pub audit: Option<Arc<AuditLog>>,
}

#[derive(Debug, Serialize)]
pub struct PublishedResp {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResp {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResp {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn index_handler() -> &'static str {
    "fraudnet ingest ready"
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<AlertDraft>,
) -> Response {
    match state.sink.submit(draft).await {
        Ok(id) => (StatusCode::OK, Json(PublishedResp { id })).into_response(),
        Err(e) => {
            warn!("Rejected alert submission: {}", e);
            let status = match e {
                PublishError::NotAuthenticated => StatusCode::SERVICE_UNAVAILABLE,
                PublishError::Invalid { .. } => StatusCode::BAD_REQUEST,
                PublishError::Store { .. } => StatusCode::BAD_GATEWAY,
                PublishError::Signing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e)
        }
    }
}

async fn audit_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(audit) = &state.audit else {
        return error_response(StatusCode::NOT_FOUND, "audit log not available");
    };

    match audit.entries().await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/alerts", post(publish_handler))
        .route("/alerts/audit", get(audit_handler))
        .with_state(state)
}

/// HTTP ingest server
pub struct HttpServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(
        config: ServerConfig,
        sink: Arc<dyn AlertSink>,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            config,
            state: Arc::new(AppState { sink, audit }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("HTTP ingest listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP ingest stopped");
        Ok(())
    }
}

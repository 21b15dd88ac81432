//! HTTP server implementation.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{admission_control, AdmissionState};
use crate::error::{Result, TurnstileError};

/// Build the service router with admission control in front of every route.
pub fn router(state: AdmissionState) -> Router {
    Router::new()
        .route("/", get(status))
        .layer(axum::middleware::from_fn_with_state(state, admission_control))
        .layer(TraceLayer::new_for_http())
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// HTTP server fronted by the admission middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission state shared by all requests
    state: AdmissionState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AdmissionState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

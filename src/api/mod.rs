//! REST + WebSocket gateway in front of the active runtime.

pub mod error;
pub mod handlers;
pub mod types;
pub mod ws;

pub use error::{ApiError, ApiResult};
pub use ws::WsHub;

use crate::registry::RuntimeRegistry;
use crate::Result;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RuntimeRegistry>,
    pub hub: Arc<WsHub>,
}

impl AppState {
    pub fn new(registry: Arc<RuntimeRegistry>) -> Self {
        Self {
            registry,
            hub: Arc::new(WsHub::new()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{id}/prompt", post(handlers::send_prompt))
        .route("/sessions/{id}/output", get(handlers::capture_output))
        .route("/sessions/{id}/ws", get(ws::ws_handler))
        .layer(trace_layer)
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, runtime = %state.registry.active_name(), "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

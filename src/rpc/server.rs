use super::handlers::*;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub struct RpcServer {
    addr: SocketAddr,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pools", get(get_pools))
        .route("/metrics", get(get_metrics))
        .route("/register_input", post(register_input))
        .route("/confirm_input", post(confirm_input))
        .route("/check_output", post(check_output))
        .route("/register_output", post(register_output))
        .route("/reveal_output", post(reveal_output))
        .route("/signing", post(signing))
        .route("/disconnect", post(disconnect))
        .route("/messages/:username", get(get_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

impl RpcServer {
    pub fn new(port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Self { addr }
    }

    pub async fn run(self, state: AppState) -> Result<()> {
        tracing::info!("RPC server listening on {}", self.addr);

        let listener = TcpListener::bind(self.addr).await?;
        serve(listener, state).await
    }
}

use super::types::*;
use crate::coordinator::{Coordinator, InputRegistration};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::notify::SessionHub;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub sessions: Arc<SessionHub>,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = if self.error_code >= 600 {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(self)).into_response()
    }
}

/// Coordinator calls block on locks and node RPC.
async fn blocking<T, F>(f: F) -> Result<T, ErrorResponse>
where
    F: FnOnce() -> CoordinatorResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| ErrorResponse::internal())?
        .map_err(ErrorResponse::from)
}

fn parse_hex(hex_str: &str, label: &str) -> Result<Vec<u8>, ErrorResponse> {
    hex::decode(hex_str).map_err(|_| ErrorResponse::invalid_argument(format!("Invalid {} hex", label)))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn get_pools(State(app): State<AppState>) -> Result<Json<PoolsResponse>, ErrorResponse> {
    let coordinator = app.coordinator.clone();
    let pools = blocking(move || Ok(coordinator.pools_status())).await?;
    Ok(Json(PoolsResponse { pools }))
}

pub async fn get_metrics(State(app): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse { metrics: app.coordinator.metrics().snapshot() })
}

pub async fn register_input(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterInputRequest>,
) -> Result<Json<RegisterInputResponse>, ErrorResponse> {
    let registration = InputRegistration {
        pool_id: req.pool_id,
        username: req.username,
        signature: req.signature,
        utxo_hash: req.utxo_hash,
        utxo_index: req.utxo_index,
        liquidity: req.liquidity,
        ip: peer.ip().to_string(),
    };
    let coordinator = app.coordinator.clone();
    let input = blocking(move || coordinator.register_input(&registration)).await?;
    Ok(Json(RegisterInputResponse {
        pool_id: input.pool_id,
        utxo: input.outpoint.key(),
        status: "QUEUED".into(),
    }))
}

pub async fn confirm_input(
    State(app): State<AppState>,
    Json(req): Json<ConfirmInputRequest>,
) -> Result<Json<ConfirmInputResponse>, ErrorResponse> {
    let blinded = parse_hex(&req.blinded_bordereau, "blinded_bordereau")?;
    let coordinator = app.coordinator.clone();
    let mix_id = req.mix_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        coordinator.confirm_input(&req.mix_id, &req.username, &blinded, &req.user_hash)
    })
    .await
    .map_err(|_| ErrorResponse::internal())?;

    match result {
        Ok(signed) => Ok(Json(ConfirmInputResponse {
            mix_id,
            status: "CONFIRMED".into(),
            signed_bordereau: Some(hex::encode(signed)),
        })),
        Err(CoordinatorError::QueueInstead { .. }) => {
            Ok(Json(ConfirmInputResponse { mix_id, status: "QUEUED".into(), signed_bordereau: None }))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn check_output(
    State(app): State<AppState>,
    Json(req): Json<CheckOutputRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let coordinator = app.coordinator.clone();
    blocking(move || coordinator.check_output(&req.receive_address, &req.signature)).await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn register_output(
    State(app): State<AppState>,
    Json(req): Json<RegisterOutputRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let unblinded = parse_hex(&req.unblinded_signed_bordereau, "unblinded_signed_bordereau")?;
    let bordereau = parse_hex(&req.bordereau, "bordereau")?;
    let coordinator = app.coordinator.clone();
    blocking(move || coordinator.register_output(&req.inputs_hash, &unblinded, &req.receive_address, &bordereau))
        .await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn reveal_output(
    State(app): State<AppState>,
    Json(req): Json<RevealOutputRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let coordinator = app.coordinator.clone();
    blocking(move || coordinator.reveal_output(&req.mix_id, &req.username, &req.receive_address)).await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn signing(
    State(app): State<AppState>,
    Json(req): Json<SigningRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let witness = req
        .witness
        .iter()
        .map(|item| parse_hex(item, "witness"))
        .collect::<Result<Vec<_>, _>>()?;
    let coordinator = app.coordinator.clone();
    blocking(move || coordinator.register_signature(&req.mix_id, &req.username, &witness)).await?;
    Ok(Json(StatusResponse::ok()))
}

pub async fn disconnect(
    State(app): State<AppState>,
    Json(req): Json<DisconnectRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let coordinator = app.coordinator.clone();
    let username = req.username.clone();
    blocking(move || {
        coordinator.on_disconnect(&username);
        Ok(())
    })
    .await?;
    app.sessions.remove(&req.username);
    Ok(Json(StatusResponse::ok()))
}

pub async fn get_messages(State(app): State<AppState>, Path(username): Path<String>) -> Json<MessagesResponse> {
    Json(MessagesResponse { messages: app.sessions.drain(&username) })
}

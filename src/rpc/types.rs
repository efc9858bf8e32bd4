use crate::coordinator::PoolStatus;
use crate::error::{CoordinatorError, ErrorCode};
use crate::metrics::MetricsSnapshot;
use crate::notify::ServerMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolsResponse {
    pub pools: Vec<PoolStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterInputRequest {
    pub pool_id: String,
    pub username: String,
    /// Signed message over `pool_id`, base64.
    pub signature: String,
    pub utxo_hash: String,
    pub utxo_index: i64,
    pub liquidity: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterInputResponse {
    pub pool_id: String,
    pub utxo: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmInputRequest {
    pub mix_id: String,
    pub username: String,
    /// hex
    pub blinded_bordereau: String,
    pub user_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmInputResponse {
    pub mix_id: String,
    /// CONFIRMED, or QUEUED when the input went back to its pool.
    pub status: String,
    pub signed_bordereau: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckOutputRequest {
    pub receive_address: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterOutputRequest {
    pub inputs_hash: String,
    /// hex
    pub unblinded_signed_bordereau: String,
    pub receive_address: String,
    /// hex
    pub bordereau: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevealOutputRequest {
    pub mix_id: String,
    pub username: String,
    pub receive_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SigningRequest {
    pub mix_id: String,
    pub username: String,
    /// Witness stack items, hex.
    pub witness: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { status: "OK".into() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<ServerMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: u16,
    pub message: String,
}

impl ErrorResponse {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self { error_code: ErrorCode::InvalidArgument.as_u16(), message: message.into() }
    }

    pub fn internal() -> Self {
        Self { error_code: ErrorCode::ServerError.as_u16(), message: "Internal server error".into() }
    }
}

impl From<CoordinatorError> for ErrorResponse {
    fn from(e: CoordinatorError) -> Self {
        if let CoordinatorError::System(inner) = &e {
            tracing::error!("request failed: {:#}", inner);
        }
        Self { error_code: e.code().as_u16(), message: e.user_message() }
    }
}

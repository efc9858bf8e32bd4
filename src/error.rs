//! Error taxonomy for the coordinator.
//!
//! Every rejection a client can see carries a stable [`ErrorCode`] plus a
//! human-readable message. Internal failures (collaborators, storage) travel
//! as `anyhow::Error` and are only surfaced as a generic server error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message for any round lookup or phase mismatch, whatever the cause.
pub const MIX_FAILED_MESSAGE: &str = "Mix failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ServerError,
    VersionMismatch,
    InvalidArgument,
    InvalidBlockHeight,
    InputRejected,
    InputAlreadyRegistered,
    InputBanned,
    PushtxError,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::ServerError => 500,
            ErrorCode::VersionMismatch => 600,
            ErrorCode::InvalidArgument => 601,
            ErrorCode::InvalidBlockHeight => 602,
            ErrorCode::InputRejected => 610,
            ErrorCode::InputAlreadyRegistered => 611,
            ErrorCode::InputBanned => 612,
            ErrorCode::PushtxError => 620,
        }
    }
}

/// Raised by the blockchain collaborator when the node refuses a transaction.
#[derive(Clone, Debug, Error)]
#[error("broadcast rejected: {reason}")]
pub struct BroadcastError {
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Input-rejected and already-registered kinds. Nothing was mutated.
    #[error("{message}")]
    Rejected { code: ErrorCode, message: String },

    /// Admission guard failed at confirmation time; the input goes back to
    /// its pool queue. Never shown to the user as an error.
    #[error("queued back to pool: {reason}")]
    QueueInstead { reason: String },

    /// Round not found or not in the expected phase.
    #[error("{}", MIX_FAILED_MESSAGE)]
    MixFailed,

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        CoordinatorError::Rejected { code, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::rejected(ErrorCode::InvalidArgument, message)
    }

    pub fn input_rejected(message: impl Into<String>) -> Self {
        Self::rejected(ErrorCode::InputRejected, message)
    }

    pub fn already_registered(message: impl Into<String>) -> Self {
        Self::rejected(ErrorCode::InputAlreadyRegistered, message)
    }

    pub fn queue_instead(reason: impl Into<String>) -> Self {
        CoordinatorError::QueueInstead { reason: reason.into() }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::Rejected { code, .. } => *code,
            CoordinatorError::QueueInstead { .. } => ErrorCode::InputRejected,
            CoordinatorError::MixFailed => ErrorCode::InputRejected,
            CoordinatorError::Broadcast(_) => ErrorCode::PushtxError,
            CoordinatorError::System(_) => ErrorCode::ServerError,
        }
    }

    /// Message safe to hand to a client. System errors are not leaked.
    pub fn user_message(&self) -> String {
        match self {
            CoordinatorError::System(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_already_registered(&self) -> bool {
        self.code() == ErrorCode::InputAlreadyRegistered
    }
}

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::ServerError.as_u16(), 500);
        assert_eq!(ErrorCode::InvalidArgument.as_u16(), 601);
        assert_eq!(ErrorCode::InputAlreadyRegistered.as_u16(), 611);
        assert_eq!(ErrorCode::InputBanned.as_u16(), 612);
        assert_eq!(ErrorCode::PushtxError.as_u16(), 620);
    }

    #[test]
    fn mix_failed_is_generic() {
        assert_eq!(CoordinatorError::MixFailed.to_string(), "Mix failed");
    }

    #[test]
    fn system_errors_are_not_leaked() {
        let err = CoordinatorError::from(anyhow::anyhow!("sled: io error at /secret/path"));
        assert_eq!(err.code(), ErrorCode::ServerError);
        assert!(!err.user_message().contains("secret"));
    }
}

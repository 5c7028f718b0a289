use crate::ledger::LedgerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoomError>;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: need {need}, have {available}")]
    InsufficientFunds { need: u64, available: u64 },

    #[error("Ledger unreachable: {0}")]
    LedgerUnreachable(String),

    #[error("Ledger timeout: {0}")]
    LedgerTimeout(String),

    #[error("Ledger rejected operation: {0}")]
    LedgerRejected(String),

    #[error("Ledger and store diverged: {0}")]
    PartialInconsistency(String),

    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: String },

    #[error("Participant {user_id} not found in room {room_id}")]
    ParticipantNotFound { room_id: String, user_id: String },

    #[error("Not permitted: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::PartialInconsistency(msg.into())
    }

    pub fn room_not_found(room_id: impl Into<String>) -> Self {
        Self::RoomNotFound {
            room_id: room_id.into(),
        }
    }
}

impl From<LedgerError> for RoomError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unreachable(msg) => RoomError::LedgerUnreachable(msg),
            LedgerError::Timeout(msg) => RoomError::LedgerTimeout(msg),
            LedgerError::Rejected(msg) => RoomError::LedgerRejected(msg),
        }
    }
}

use thiserror::Error;

use crate::engine::{EngineError, SessionId};

#[derive(Debug, Error)]
pub enum PhoneError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not connected: socket must be up and the account registered")]
    NotConnected,
    #[error("no call with session id {0}")]
    NotFound(SessionId),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("invalid DTMF tones: {0}")]
    InvalidDigits(String),
    #[error("a call is already active and multiple calls are disabled")]
    CallLimitReached,
    #[error("session {session_id} cannot do that now: {reason}")]
    InvalidState { session_id: SessionId, reason: String },
    #[error("session {0} has no audio sender")]
    NoAudioSender(SessionId),
    #[error("a transfer is already in progress for session {0}")]
    TransferInProgress(SessionId),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

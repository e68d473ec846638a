//! Error handling for the commissioning Security Manager
use super::constants::*;
use super::state::State;
use std::fmt;
use thiserror::Error;

/// Protocol error codes exchanged in `processFail` and reported to the
/// application when a run ends in failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error recorded for this run
    None,
    /// No authentication method in common
    UnsupportedAuthMethod,
    /// Authentication code did not match
    NoMatchAuthVal,
    /// Final security value did not match
    NoMatchKeyConfirm,
    /// No seed entry for a key refresh
    MissingKey,
    /// Message arrived out of sequence
    UnexpectedMessage,
    /// Peer did not answer in time
    Timeout,
    /// Peer never acknowledged the commissioning request
    PeerUnresponsive,
    /// Value this implementation does not know
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        match code {
            SM_ERROR_NONE => ErrorCode::None,
            SM_ERROR_UNSUPPORTED_AUTH_METHOD => ErrorCode::UnsupportedAuthMethod,
            SM_ERROR_NO_MATCH_AUTH_VAL => ErrorCode::NoMatchAuthVal,
            SM_ERROR_NO_MATCH_KEY_CONFIRM => ErrorCode::NoMatchKeyConfirm,
            SM_ERROR_MISSING_KEY => ErrorCode::MissingKey,
            SM_ERROR_UNEXPECTED_MSG => ErrorCode::UnexpectedMessage,
            SM_ERROR_TIMEOUT => ErrorCode::Timeout,
            SM_ERROR_PEER_UNRESPONSIVE => ErrorCode::PeerUnresponsive,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        match code {
            ErrorCode::None => SM_ERROR_NONE,
            ErrorCode::UnsupportedAuthMethod => SM_ERROR_UNSUPPORTED_AUTH_METHOD,
            ErrorCode::NoMatchAuthVal => SM_ERROR_NO_MATCH_AUTH_VAL,
            ErrorCode::NoMatchKeyConfirm => SM_ERROR_NO_MATCH_KEY_CONFIRM,
            ErrorCode::MissingKey => SM_ERROR_MISSING_KEY,
            ErrorCode::UnexpectedMessage => SM_ERROR_UNEXPECTED_MSG,
            ErrorCode::Timeout => SM_ERROR_TIMEOUT,
            ErrorCode::PeerUnresponsive => SM_ERROR_PEER_UNRESPONSIVE,
            ErrorCode::Other(code) => code,
        }
    }
}

impl ErrorCode {
    pub fn to_u8(&self) -> u8 {
        u8::from(*self)
    }

    pub fn from_u8(value: u8) -> Self {
        Self::from(value)
    }

    /// Failures after which retrying the same peer cannot succeed
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnsupportedAuthMethod | ErrorCode::NoMatchAuthVal | ErrorCode::NoMatchKeyConfirm
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::None => write!(f, "none"),
            ErrorCode::UnsupportedAuthMethod => write!(f, "unsupported auth method"),
            ErrorCode::NoMatchAuthVal => write!(f, "auth value mismatch"),
            ErrorCode::NoMatchKeyConfirm => write!(f, "key confirmation mismatch"),
            ErrorCode::MissingKey => write!(f, "missing key"),
            ErrorCode::UnexpectedMessage => write!(f, "unexpected message"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::PeerUnresponsive => write!(f, "peer not responding"),
            ErrorCode::Other(code) => write!(f, "unknown error 0x{:02x}", code),
        }
    }
}

/// Security Manager error type
#[derive(Debug, Clone, Error)]
pub enum SmError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown command id: 0x{0:04x}")]
    UnknownCommand(u16),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("A commissioning run is already in progress")]
    InProgress,

    #[error("No seed key entry for device")]
    MissingSeedEntry,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key table error: {0}")]
    KeyTable(String),
}

impl SmError {
    /// Code reported to the peer when this error ends a run
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SmError::MissingSeedEntry | SmError::Storage(_) | SmError::KeyTable(_) => {
                ErrorCode::MissingKey
            }
            _ => ErrorCode::UnexpectedMessage,
        }
    }
}

/// Result type for Security Manager operations
pub type SmResult<T> = Result<T, SmError>;

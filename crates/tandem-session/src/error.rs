use tandem_common::Error as CommonError;
use tandem_media::MediaError;
use tandem_proto::{CandidateError, ProtoError, SdpError, StunError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// No traversal server answered within the timeout.
    #[error("no traversal server answered ({servers} tried)")]
    TraversalTimeout { servers: usize },

    /// Every traversal server failed before a response could arrive.
    #[error("all {servers} traversal servers are unreachable")]
    TraversalUnreachable { servers: usize },

    #[error("cannot {operation} in signaling state {state}")]
    InvalidStateTransition {
        state: String,
        operation: &'static str,
    },

    #[error("candidate for ufrag `{ufrag}` belongs to a previous ICE generation")]
    StaleCandidate { ufrag: String },

    /// Decoding kept failing on a track past the configured threshold.
    #[error("{consecutive} consecutive decode failures on track {mid}")]
    DecodeFailure { mid: u32, consecutive: u32 },

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("ICE failed: {0}")]
    IceFailed(String),

    #[error("session closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl SessionError {
    /// Terminal errors end the current session and are surfaced as
    /// `error` events. Everything else is absorbed where it is detected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NegotiationFailed(_) | Self::IceFailed(_) | Self::DecodeFailure { .. }
        )
    }

    pub fn invalid_state(state: impl std::fmt::Display, operation: &'static str) -> Self {
        Self::InvalidStateTransition {
            state: state.to_string(),
            operation,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<CommonError> for SessionError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Config(msg) => Self::Config(msg),
            CommonError::Io(err) => Self::Io(err.to_string()),
            CommonError::Json(err) => Self::Protocol(err.to_string()),
        }
    }
}

impl From<SdpError> for SessionError {
    fn from(err: SdpError) -> Self {
        Self::NegotiationFailed(err.to_string())
    }
}

impl From<CandidateError> for SessionError {
    fn from(err: CandidateError) -> Self {
        Self::Protocol(format!("bad candidate: {err}"))
    }
}

impl From<StunError> for SessionError {
    fn from(err: StunError) -> Self {
        Self::Protocol(format!("stun: {err}"))
    }
}

impl From<ProtoError> for SessionError {
    fn from(err: ProtoError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<tandem_crypto::ConnectionError> for SessionError {
    fn from(err: tandem_crypto::ConnectionError) -> Self {
        Self::Crypto(err.to_string())
    }
}

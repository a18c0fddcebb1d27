use shared::{
    domain::{ClientTempId, ConversationId},
    protocol::PayloadError,
};
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("live channel is disconnected")]
    Disconnected,
    #[error("no live connection; call connect first")]
    NotConnected,
    #[error("timed out waiting for `{op}` acknowledgement")]
    AckTimeout { op: &'static str },
    #[error("server rejected `{op}`: {reason}")]
    Rejected { op: &'static str, reason: String },
    #[error("join for conversation {conversation_id} timed out")]
    JoinTimeout { conversation_id: ConversationId },
    #[error("join for conversation {conversation_id} failed: {reason}")]
    JoinFailure {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error("history for conversation {conversation_id} is unavailable: {reason}")]
    HistoryUnavailable {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error("upload of attachment #{index} ({filename}) failed: {reason}")]
    UploadFailure {
        index: usize,
        filename: String,
        reason: String,
    },
    #[error("send {client_temp_id} failed: {reason}")]
    SendFailure {
        client_temp_id: ClientTempId,
        reason: String,
    },
    #[error("send {client_temp_id} was not acknowledged in time")]
    SendTimeout { client_temp_id: ClientTempId },
    #[error("message has no text, attachments or gif")]
    EmptyMessage,
    #[error("no failed message with client id {client_temp_id}")]
    UnknownMessage { client_temp_id: ClientTempId },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Transport trouble that is recovered locally (backoff, fallback fetch)
    /// rather than surfaced to the user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Disconnected
                | Self::AckTimeout { .. }
                | Self::JoinTimeout { .. }
                | Self::JoinFailure { .. }
        )
    }
}

impl From<PayloadError> for SyncError {
    fn from(value: PayloadError) -> Self {
        Self::InvalidPayload(value.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::InvalidPayload(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

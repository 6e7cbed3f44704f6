//! Error taxonomy for the voice session engine.
//!
//! Local failures (a bad audio chunk, a frame sent while the session is
//! closing) are counted and logged where they happen. An error that reaches
//! the engine's failure path always ends the session.

use thiserror::Error;

pub type VoiceResult<T> = Result<T, VoiceError>;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone or speaker unavailable, or permission denied.
    #[error("audio device error: {0}")]
    Device(String),

    /// Generic connection failure, remote error, or unexpected close.
    #[error("connection error: {0}")]
    Connection(String),

    /// The endpoint rejected the credential ("entity not found" class).
    #[error("credential error: {0}")]
    Credential(String),

    /// A frame or control message could not be queued on the link.
    #[error("send failed: {0}")]
    Send(String),

    /// An inbound audio chunk could not be decoded.
    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// `advance` needed to reconnect but no session context was ever started.
    #[error("no session context: call start() before advance()")]
    NoContext,
}

impl VoiceError {
    /// Classify a remote error message, promoting the "entity not found"
    /// class to [`VoiceError::Credential`].
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_credential_error(&message) {
            Self::Credential(message)
        } else {
            Self::Connection(message)
        }
    }
}

/// Detect the invalid/expired credential class of remote errors.
pub fn is_credential_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("requested entity was not found")
        || lower.contains("entity not found")
        || lower.contains("not_found")
        || lower.contains("api key not valid")
}

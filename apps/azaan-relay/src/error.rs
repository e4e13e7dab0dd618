use thiserror::Error;

use crate::protocol::ServerMessage;

/// Failures reported back to the connection that caused them. None of these affect any other
/// connection or the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("channel id required")]
    MissingChannelId,
    #[error("broadcast not active for this channel")]
    ChannelNotLive,
    #[error("invalid message format: {0}")]
    InvalidMessage(String),
}

impl RelayError {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            message: self.to_string(),
        }
    }
}

//! Client error types.

use corelink_proto::{CodecError, DisconnectCause, UnsupportedOpError};
use thiserror::Error;

/// Client error type.
///
/// None of these cross the worker/caller boundary as raised errors:
/// the worker translates each into one [`DisconnectCause`] delivered to
/// every registered status observer, plus a disconnected notification
/// to every data receiver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The socket could not be opened.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The agent rejected the authentication handshake.
    #[error("authorization rejected by agent")]
    AuthRejected,

    /// Unauthorized marker or malformed reply, scoped to one call.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Mid-session I/O failure on an otherwise-authenticated session.
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    /// The environment reported no network before any socket attempt.
    #[error("no network connectivity")]
    NoConnectivity,

    /// Caller-supplied operation code outside the recognized set; a
    /// programming error, rejected synchronously.
    #[error(transparent)]
    UnsupportedOperation(#[from] UnsupportedOpError),
}

impl ClientError {
    /// Cause delivered to observers when this error ends a session.
    /// Authorization failures split on whether the endpoint carried a
    /// password, regardless of which call surfaced the marker.
    pub fn disconnect_cause(&self, had_password: bool) -> DisconnectCause {
        match self {
            Self::ConnectFailed(_) => DisconnectCause::ConnectFailure,
            Self::AuthRejected | Self::Codec(CodecError::Unauthorized) => {
                if had_password {
                    DisconnectCause::AuthFailWrongPassword
                } else {
                    DisconnectCause::AuthFailNoPassword
                }
            }
            // UnsupportedOperation is rejected at the enum boundary and
            // never reaches a live session.
            Self::Codec(CodecError::Malformed { .. })
            | Self::ConnectionDropped(_)
            | Self::UnsupportedOperation(_) => DisconnectCause::ConnectionDrop,
            Self::NoConnectivity => DisconnectCause::NoConnectivity,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

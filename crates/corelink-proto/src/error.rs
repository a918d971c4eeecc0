//! Protocol error types.

use thiserror::Error;

/// Codec error type.
///
/// Parsers distinguish exactly two failure conditions: the agent
/// explicitly refusing the call, and a document we cannot make sense
/// of. Everything tolerable (empty lists, single bad fields) is not an
/// error at this layer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The reply carried the agent's `<unauthorized/>` marker. Checked
    /// before anything else; it may appear in the envelope of any
    /// reply, not just the authentication step.
    #[error("unauthorized")]
    Unauthorized,

    /// The reply was not well-formed, or a required element is absent.
    /// `entity` names what was being parsed, for diagnosability.
    #[error("malformed {entity} reply: {detail}")]
    Malformed {
        entity: &'static str,
        detail: String,
    },
}

impl CodecError {
    pub(crate) fn malformed(entity: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            entity,
            detail: detail.into(),
        }
    }
}

/// An operation code outside the recognized closed set. A programming
/// error on the caller's side, never a network failure and never shown
/// to an end user.
#[derive(Debug, Error)]
#[error("unsupported operation code: {code}")]
pub struct UnsupportedOpError {
    pub code: String,
}

/// Terminal reason a connection ended, delivered exactly once to every
/// registered status observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Orderly teardown (explicit disconnect, or the agent shut down on
    /// request).
    Normal,
    /// The socket could not be opened.
    ConnectFailure,
    /// The agent refused authorization and no password was supplied.
    AuthFailNoPassword,
    /// The agent refused authorization despite a supplied password.
    AuthFailWrongPassword,
    /// Mid-session I/O or protocol failure on an authenticated session.
    ConnectionDrop,
    /// The environment reported no network before any socket attempt.
    NoConnectivity,
}

pub type Result<T> = std::result::Result<T, CodecError>;

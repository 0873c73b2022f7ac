#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::{Error, Kind};

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Connect plus handshake did not finish in time
    HandshakeTimeout,
    /// No frame arrived within the heartbeat timeout
    HeartbeatTimeout,
    /// The peer closed the socket, with the close code if one was sent
    Closed { code: Option<u16>, reason: String },
    /// The manager is closed and not trying to connect
    NotConnected,
    /// Inbound frame did not match the `{ type, data }` envelope
    MalformedFrame(serde_json::Error),
    /// Inbound frame was not text
    UnexpectedFrame(&'static str),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::HandshakeTimeout => write!(f, "WebSocket handshake timed out"),
            Self::HeartbeatTimeout => write!(f, "WebSocket heartbeat timed out"),
            Self::Closed {
                code: Some(code),
                reason,
            } => write!(f, "WebSocket closed with code {code}: {reason}"),
            Self::Closed { code: None, .. } => write!(f, "WebSocket closed without a close frame"),
            Self::NotConnected => write!(f, "WebSocket is not connected"),
            Self::MalformedFrame(e) => write!(f, "Malformed WebSocket frame: {e}"),
            Self::UnexpectedFrame(kind) => write!(f, "Unexpected {kind} WebSocket frame"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MalformedFrame(e) => Some(e),
            _ => None,
        }
    }
}

impl WsError {
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::MalformedFrame(_) | Self::UnexpectedFrame(_) => Kind::Protocol,
            _ => Kind::Connection,
        }
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(e.kind(), e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(e).into()
    }
}

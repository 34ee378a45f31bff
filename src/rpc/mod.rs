//! Abstraction over the RPC connection with the Calliope server.

mod stubs;
mod targets;

pub mod websocket;

use std::time::Duration;

use calliope_client_api_proto::{
    codes, CodedError, ConnectionId, TargetId,
};
use derive_more::{Display, From};
use url::Url;

use crate::platform::TransportError;

#[doc(inline)]
pub use self::{
    stubs::{AuthorProxy, MetaProxy, SessionProxy},
    targets::{
        AlreadyBoundError, Reply, SendFn, TargetProxy, Targets, UnboundError,
    },
    websocket::{ClientState, TransportFactory, WebSocketRpcClient},
};

/// Connection with the remote was closed.
#[derive(Clone, Debug, PartialEq)]
pub enum CloseMsg {
    /// Transport was closed with an orderly WebSocket close frame.
    Normal {
        /// WebSocket close code.
        code: u16,

        /// Free-form close reason.
        reason: String,
    },

    /// Connection broke without a close frame. Consider reconnecting.
    Abnormal(String),
}

/// URL of the server API endpoint.
///
/// Derived from the `http(s)` endpoint the application is configured with;
/// only the scheme changes, the path names the API endpoint and is used
/// as provided.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ApiUrl(Url);

impl ApiUrl {
    /// Derives the WebSocket URL from the given endpoint.
    ///
    /// `http` becomes `ws`, `https` becomes `wss`; `ws(s)` URLs pass
    /// through untouched.
    ///
    /// # Errors
    ///
    /// With [`InvalidUrlError`] if `endpoint` is not parseable or carries a
    /// scheme other than the four above.
    pub fn from_endpoint(endpoint: &str) -> Result<Self, InvalidUrlError> {
        let mut url = Url::parse(endpoint)?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(Self(url)),
            other => {
                return Err(InvalidUrlError::UnsupportedScheme(other.into()))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| InvalidUrlError::UnsupportedScheme(scheme.into()))?;
        Ok(Self(url))
    }

    /// Returns this URL as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Errors of deriving an [`ApiUrl`] from a configured endpoint.
#[derive(Clone, Debug, Display, From, PartialEq)]
pub enum InvalidUrlError {
    /// Endpoint is not a parseable URL.
    #[display(fmt = "cannot parse endpoint URL: {}", _0)]
    Parse(url::ParseError),

    /// Endpoint carries a scheme this client cannot speak.
    #[display(fmt = "unsupported endpoint scheme: {}", _0)]
    #[from(ignore)]
    UnsupportedScheme(String),
}

/// Connection-level failures raised by [`WebSocketRpcClient`].
///
/// Every variant names the connection it was raised against, so that log
/// lines and surfaced errors stay attributable after reconnects.
#[derive(Clone, Debug, Display, PartialEq)]
pub enum ConnectionError {
    /// Socket is closed; the `detail` carries the close code and reason.
    #[display(fmt = "[{}] connection closed: {}", connection_id, detail)]
    Closed {
        /// Connection the error was raised against.
        connection_id: ConnectionId,

        /// Close code and reason, or a client-side explanation.
        detail: String,
    },

    /// Server announced a soft close; new sends are rejected while pending
    /// replies drain.
    #[display(fmt = "[{}] connection is closing", _0)]
    Closing(ConnectionId),

    /// Underlying transport failed.
    #[display(fmt = "[{}] connection error", _0)]
    Failed(ConnectionId),

    /// Send was addressed to a target this connection does not know.
    #[display(fmt = "[{}] unknown target: {}", connection_id, target)]
    UnknownTarget {
        /// Connection the error was raised against.
        connection_id: ConnectionId,

        /// The unknown target.
        target: TargetId,
    },
}

/// Failures of a single RPC call.
#[derive(Clone, Debug, Display, From, PartialEq)]
pub enum CallError {
    /// The connection failed the call before (or while) it was in flight.
    #[display(fmt = "{}", _0)]
    Connection(ConnectionError),

    /// Server answered the call with an error. The payload is wrapped with
    /// an outer [`codes::REMOTE_ERROR`] naming the connection it arrived
    /// over; the original error rides along as the cause.
    #[display(fmt = "remote error: {}", _0)]
    Remote(CodedError),

    /// Client-side deadline for the call expired.
    #[display(fmt = "timed out after {:?}", _0)]
    #[from(ignore)]
    TimedOut(Duration),

    /// Reply arrived but did not have the shape the caller expected.
    #[display(fmt = "unexpected reply shape: {}", _0)]
    #[from(ignore)]
    InvalidReply(String),

    /// The RPC client was dropped while the call was pending.
    #[display(fmt = "RPC client has been dropped")]
    ClientGone,
}

impl CallError {
    /// Indicates whether this error is the benign poll-again signal: either
    /// a client-side deadline or a server-reported [`codes::TIMED_OUT`].
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        match self {
            Self::TimedOut(_) => true,
            Self::Remote(err) => err.has_code(codes::TIMED_OUT),
            _ => false,
        }
    }

    /// Indicates whether this error was caused by connection trouble rather
    /// than by the called method itself.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ClientGone)
    }
}

/// Errors of opening a [`WebSocketRpcClient`] connection.
#[derive(Clone, Debug, Display, From, PartialEq)]
pub enum RpcClientError {
    /// Transport could not be established.
    #[display(fmt = "could not establish connection: {}", _0)]
    CouldNotEstablish(TransportError),

    /// Connection established but the handshake calls failed.
    #[display(fmt = "handshake failed: {}", _0)]
    Handshake(CallError),

    /// `open()` was called while the server is soft-closing the connection.
    #[display(fmt = "[{}] connection is being closed by the server", _0)]
    #[from(ignore)]
    SoftClosing(ConnectionId),

    /// The RPC client was dropped mid-open.
    #[display(fmt = "RPC client has been dropped")]
    ClientGone,
}

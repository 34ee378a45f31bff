//! Abstraction over the low-level socket carrying RPC frames.

use calliope_client_api_proto::{Message, ServerFrame};
use derive_more::Display;
use futures::stream::LocalBoxStream;
use tracerr::Traced;

use crate::{rpc::CloseMsg, utils::JsonParseError};

/// RPC transport between a client and a server.
///
/// One instance wraps one underlying socket; reconnecting means building a
/// fresh transport through the factory owned by the RPC client.
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait RpcTransport {
    /// Returns [`LocalBoxStream`] of all frames received by this transport.
    fn on_frame(&self) -> LocalBoxStream<'static, ServerFrame>;

    /// Sends the given [`Message`] to the server.
    ///
    /// # Errors
    ///
    /// Errors if the message cannot be serialized or the socket is already
    /// closed.
    fn send(&self, msg: &Message) -> Result<(), Traced<TransportError>>;

    /// Subscribes to this transport's [`TransportState`] changes.
    fn on_state_change(&self) -> LocalBoxStream<'static, TransportState>;
}

/// Errors that may occur when working with an [`RpcTransport`].
#[derive(Clone, Debug, Display, PartialEq)]
pub enum TransportError {
    /// Failed to establish the underlying socket connection.
    #[display(fmt = "Failed to create WebSocket: {}", _0)]
    CreateSocket(String),

    /// Outbound [`Message`] could not be serialized.
    #[display(fmt = "Failed to serialize message: {}", _0)]
    SerializeMessage(JsonParseError),

    /// Message was sent to an already-closed socket.
    #[display(fmt = "Underlying socket is closed")]
    ClosedSocket,
}

/// [`RpcTransport`] states.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportState {
    /// Socket has been created but the connection is not open yet.
    Connecting,

    /// Connection is open and ready to carry frames.
    Open,

    /// Connection is closed or could not be opened.
    ///
    /// The [`CloseMsg`] tells whether the close was orderly.
    Closed(CloseMsg),
}

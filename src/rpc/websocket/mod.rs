//! WebSocket RPC connection.

mod client;

#[doc(inline)]
pub use self::client::{ClientState, TransportFactory, WebSocketRpcClient};

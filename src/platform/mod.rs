//! Platform bindings: task spawning, timers and the WebSocket transport.
//!
//! Everything runtime-specific funnels through this module so the rest of
//! the crate stays agnostic of how futures get executed and how the socket
//! is driven.

mod native;

pub mod transport;

#[doc(inline)]
pub use self::{
    native::{delay_for, spawn, WebSocketRpcTransport},
    transport::{RpcTransport, TransportError, TransportState},
};

#[cfg(feature = "mockable")]
pub use self::transport::MockRpcTransport;

//! Client library for the Calliope collaborative document server.
//!
//! The crate has two halves. The lower one is an RPC core: a WebSocket
//! transport multiplexing method calls against remote targets, correlating
//! responses by message id ([`rpc::WebSocketRpcClient`]). The upper one is
//! the editor synchronization machinery: a per-document session
//! ([`doc::DocSession`]) and the state machine ([`doc::EditorSync`]) that
//! polls the server for changes, batches local edits, and rebases concurrent
//! work with the delta algebra from `calliope-client-api-proto`.
//!
//! Everything is single-threaded and cooperative: drive the library from
//! inside a [`tokio::task::LocalSet`].

#![allow(clippy::module_name_repetitions)]
#![cfg_attr(not(feature = "mockable"), warn(missing_docs))]
#![cfg_attr(feature = "mockable", allow(missing_docs))]

pub mod doc;
pub mod editor;
pub mod platform;
pub mod rpc;
pub mod utils;

pub use calliope_client_api_proto as proto;

#[doc(inline)]
pub use self::{
    doc::{
        CaretTracker, DocSession, EditorSync, PropertyClient, SessionEvent,
        SessionInfo,
    },
    editor::{ClientEvent, Editor, EventChain, EventPayload, Range, Source},
    rpc::{ApiUrl, SessionProxy, WebSocketRpcClient},
};

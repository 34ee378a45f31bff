//! Per-document client machinery on top of the RPC core.

pub mod caret;
pub mod property;
pub mod session;
pub mod sync;

#[doc(inline)]
pub use self::{
    caret::CaretTracker,
    property::{PropertyClient, PropertyError},
    session::{DocSession, SessionError, SessionEvent, SessionInfo},
    sync::EditorSync,
};

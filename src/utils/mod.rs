//! Miscellaneous utility structs and functions.

use std::rc::Rc;

use derive_more::{Display, From};
use futures::future::AbortHandle;

/// Handle to a spawned task aborting it on drop.
#[derive(Debug, From)]
pub struct TaskHandle(AbortHandle);

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Wrapper for [`serde_json::error::Error`] that provides [`Clone`],
/// [`Debug`] and [`Display`] implementations.
#[derive(Clone, Debug, Display, From)]
#[from(forward)]
pub struct JsonParseError(Rc<serde_json::error::Error>);

impl PartialEq for JsonParseError {
    fn eq(&self, other: &Self) -> bool {
        self.0.line() == other.0.line()
            && self.0.column() == other.0.column()
            && self.0.classify() == other.0.classify()
    }
}

//! Named document states and the changes between them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{delta::Delta, RevNum};

/// `(revNum, contents)` pair naming a document state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Revision this snapshot captures.
    pub rev_num: RevNum,

    /// Full document contents, as a delta against the empty document.
    pub contents: Delta,
}

impl Snapshot {
    /// Applies `change` to this snapshot, yielding the snapshot of the
    /// change's revision.
    #[must_use]
    pub fn apply(&self, change: &Change) -> Self {
        Self {
            rev_num: change.rev_num,
            contents: self.contents.compose(&change.delta),
        }
    }
}

/// Delta taking the document from revision `revNum - 1` to `revNum`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Revision the document is at once this change is applied.
    pub rev_num: RevNum,

    /// The change itself.
    pub delta: Delta,
}

/// `(revNum, properties)` pair naming a document-metadata state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySnapshot {
    /// Revision this snapshot captures.
    pub rev_num: RevNum,

    /// Property values keyed by name.
    pub properties: HashMap<String, Value>,
}

/// Single mutation of a property map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PropertyOp {
    /// Binds `name` to `value`, replacing any earlier binding.
    Set {
        /// Property name.
        name: String,

        /// New value.
        value: Value,
    },

    /// Removes the binding of `name`, if any.
    Delete {
        /// Property name.
        name: String,
    },
}

/// Ordered list of property mutations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyDelta(pub Vec<PropertyOp>);

impl PropertyDelta {
    /// Builds a delta holding a single [`PropertyOp::Set`].
    #[must_use]
    pub fn set<N: Into<String>>(name: N, value: Value) -> Self {
        Self(vec![PropertyOp::Set {
            name: name.into(),
            value,
        }])
    }

    /// Builds a delta holding a single [`PropertyOp::Delete`].
    #[must_use]
    pub fn delete<N: Into<String>>(name: N) -> Self {
        Self(vec![PropertyOp::Delete { name: name.into() }])
    }
}

/// Property-map counterpart of [`Change`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChange {
    /// Revision the property map is at once this change is applied.
    pub rev_num: RevNum,

    /// The mutations themselves.
    pub delta: PropertyDelta,
}

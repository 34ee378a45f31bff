//! The rich-text editor collaborator surface.
//!
//! The synchronization core never touches the DOM: it drives an editor
//! (Quill, in the browser embedding) exclusively through the [`Editor`]
//! trait, and observes it through the promise-chained event stream in
//! [`events`].

mod events;

use calliope_client_api_proto::Delta;
use serde::{Deserialize, Serialize};

#[doc(inline)]
pub use self::events::{
    ClientEvent, EventChain, EventPayload, EventsDroppedError,
};

/// Origin of an editor mutation or event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// The human behind the keyboard.
    User,

    /// Generic programmatic access.
    Api,

    /// This synchronization core. Reserved as its self-marker: events
    /// carrying it are echoes of the core's own mutations.
    DocClient,
}

/// Selection range inside the editor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Position of the selection start, in characters.
    pub index: usize,

    /// Length of the selection, `0` for a bare caret.
    pub length: usize,
}

/// Duplex surface of the editor being synchronized.
///
/// Mutations accept a [`Source`] so that the editor can report it back on
/// the resulting event, letting the core recognize its own echoes.
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait Editor {
    /// Returns the current document contents.
    fn contents(&self) -> Delta;

    /// Replaces the whole document.
    fn set_contents(&self, contents: Delta, source: Source);

    /// Applies a delta on top of the current document.
    fn update_contents(&self, delta: Delta, source: Source);

    /// Returns the current selection, if the editor has focus.
    fn selection(&self) -> Option<Range>;

    /// Moves the selection.
    fn set_selection(&self, range: Range);

    /// Makes the editor editable.
    fn enable(&self);

    /// Makes the editor read-only.
    fn disable(&self);

    /// Focuses the editor.
    fn focus(&self);

    /// Ends the currently accumulating undo-history batch, so that
    /// surrounding mutations do not amalgamate with the user's typing.
    fn history_cutoff(&self);

    /// Clears the undo history entirely.
    fn history_clear(&self);

    /// Returns the most recent event node of this editor's event chain.
    fn current_event(&self) -> ClientEvent;
}

//! Promise-chained editor events.
//!
//! Editor events form a singly-linked chain: each node knows its payload
//! and, once the editor emits again, its successor. A consumer walks the
//! chain with the synchronous [`ClientEvent::next_now`] and the
//! asynchronous [`ClientEvent::next`]; the producer half is [`EventChain`].
//!
//! The one non-obvious operation is [`ClientEvent::with_synthesized_next`]:
//! the merge step of the synchronization machine needs to splice an event
//! it fabricated in front of whatever the editor emits later, which is done
//! with a wrapper node delegating its link to the node it shadows.

use std::{cell::RefCell, rc::Rc};

use calliope_client_api_proto::Delta;
use derive_more::Display;
use futures::{channel::oneshot, future, future::LocalBoxFuture, FutureExt as _};

use crate::editor::{Range, Source};

/// Payload of one editor event.
#[derive(Clone, Debug)]
pub enum EventPayload {
    /// Document contents changed.
    TextChange {
        /// The change itself.
        delta: Delta,

        /// Contents before the change.
        old_contents: Delta,

        /// Origin of the change.
        source: Source,
    },

    /// Selection moved (or collapsed to none on blur).
    SelectionChange {
        /// New selection.
        range: Option<Range>,

        /// Previous selection.
        old_range: Option<Range>,

        /// Origin of the move.
        source: Source,
    },
}

/// The producer of this chain is gone; no further events will ever arrive.
#[derive(Clone, Copy, Debug, Display)]
#[display(fmt = "editor event chain has been dropped")]
pub struct EventsDroppedError;

/// Successor slot of a chain node.
enum NextLink {
    /// Successor not emitted yet; waiters parked here.
    Pending(Vec<oneshot::Sender<ClientEvent>>),

    /// Successor is known.
    Ready(ClientEvent),

    /// Producer dropped before emitting a successor.
    Dropped,
}

/// Link of a node to its successor.
enum Link {
    /// The node owns its successor slot.
    Own(RefCell<NextLink>),

    /// The node shadows another one and shares its successor.
    Delegate(Rc<Node>),
}

struct Node {
    payload: EventPayload,
    link: Link,
}

impl Node {
    fn new(payload: EventPayload) -> Rc<Self> {
        Rc::new(Self {
            payload,
            link: Link::Own(RefCell::new(NextLink::Pending(Vec::new()))),
        })
    }

    /// Resolves delegation down to the node owning the successor slot.
    fn owner(self: &Rc<Self>) -> Rc<Self> {
        let mut node = Rc::clone(self);
        loop {
            node = match &node.link {
                Link::Own(_) => return node,
                Link::Delegate(inner) => Rc::clone(inner),
            };
        }
    }
}

/// One event of the editor's event chain.
#[derive(Clone)]
pub struct ClientEvent(Rc<Node>);

impl ClientEvent {
    /// Borrows the payload of this event.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &EventPayload {
        &self.0.payload
    }

    /// Returns the successor of this event if it has been emitted already.
    #[must_use]
    pub fn next_now(&self) -> Option<ClientEvent> {
        let owner = self.0.owner();
        let link = match &owner.link {
            Link::Own(link) => link,
            Link::Delegate(_) => unreachable!("owner() returns owning nodes"),
        };
        let result = match &*link.borrow() {
            NextLink::Ready(next) => Some(next.clone()),
            NextLink::Pending(_) | NextLink::Dropped => None,
        };
        result
    }

    /// Resolves to the successor of this event, waiting for the editor to
    /// emit it if needed.
    ///
    /// # Errors
    ///
    /// With [`EventsDroppedError`] if the producing [`EventChain`] is gone.
    pub fn next(
        &self,
    ) -> LocalBoxFuture<'static, Result<ClientEvent, EventsDroppedError>> {
        let owner = self.0.owner();
        let link = match &owner.link {
            Link::Own(link) => link,
            Link::Delegate(_) => unreachable!("owner() returns owning nodes"),
        };
        let mut slot = link.borrow_mut();
        match &mut *slot {
            NextLink::Ready(next) => Box::pin(future::ok(next.clone())),
            NextLink::Dropped => Box::pin(future::err(EventsDroppedError)),
            NextLink::Pending(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Box::pin(rx.map(|result| result.map_err(|_| EventsDroppedError)))
            }
        }
    }

    /// Builds a replacement head for this event whose successor is a
    /// synthesized event carrying `payload`.
    ///
    /// The synthesized event delegates its own successor to this event, so
    /// anything the editor emits later is observed right after it, in
    /// unchanged order.
    #[must_use]
    pub fn with_synthesized_next(&self, payload: EventPayload) -> ClientEvent {
        let synthesized = ClientEvent(Rc::new(Node {
            payload,
            link: Link::Delegate(Rc::clone(&self.0)),
        }));
        ClientEvent(Rc::new(Node {
            payload: self.0.payload.clone(),
            link: Link::Own(RefCell::new(NextLink::Ready(synthesized))),
        }))
    }
}

impl std::fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientEvent").field(&self.0.payload).finish()
    }
}

/// Producer half of an editor's event chain.
///
/// Editor implementations hold one and [`EventChain::push`] a node per
/// emitted event; consumers walk the chain starting from any node handed
/// out by [`EventChain::current`].
pub struct EventChain {
    tail: RefCell<ClientEvent>,
}

impl EventChain {
    /// Creates a chain seeded with one initial event.
    #[must_use]
    pub fn new(initial: EventPayload) -> Self {
        Self {
            tail: RefCell::new(ClientEvent(Node::new(initial))),
        }
    }

    /// Returns the most recent event of this chain.
    #[must_use]
    pub fn current(&self) -> ClientEvent {
        self.tail.borrow().clone()
    }

    /// Appends an event to the chain, waking everyone awaiting it.
    pub fn push(&self, payload: EventPayload) -> ClientEvent {
        let next = ClientEvent(Node::new(payload));
        let prev = self.tail.replace(next.clone());

        let link = match &prev.0.link {
            Link::Own(link) => link,
            Link::Delegate(_) => unreachable!("chain tails own their links"),
        };
        let waiters = std::mem::replace(
            &mut *link.borrow_mut(),
            NextLink::Ready(next.clone()),
        );
        if let NextLink::Pending(waiters) = waiters {
            for tx in waiters {
                drop(tx.send(next.clone()));
            }
        }
        next
    }
}

impl Drop for EventChain {
    /// Marks the tail as dropped; parked waiters error out through their
    /// cancelled channels.
    fn drop(&mut self) {
        let tail = self.tail.borrow();
        if let Link::Own(link) = &tail.0.link {
            *link.borrow_mut() = NextLink::Dropped;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn text(text: &str, source: Source) -> EventPayload {
        EventPayload::TextChange {
            delta: Delta::new().insert(text),
            old_contents: Delta::new(),
            source,
        }
    }

    fn delta_of(event: &ClientEvent) -> String {
        match event.payload() {
            EventPayload::TextChange { delta, .. } => delta.to_string(),
            EventPayload::SelectionChange { .. } => panic!("not a text change"),
        }
    }

    #[test]
    fn next_now_sees_pushed_events_in_order() {
        let chain = EventChain::new(text("a", Source::Api));
        let head = chain.current();
        assert!(head.next_now().is_none());

        drop(chain.push(text("b", Source::User)));
        drop(chain.push(text("c", Source::User)));

        let second = head.next_now().unwrap();
        let third = second.next_now().unwrap();
        assert_eq!(delta_of(&second), r#"[insert "b"]"#);
        assert_eq!(delta_of(&third), r#"[insert "c"]"#);
        assert!(third.next_now().is_none());
    }

    #[tokio::test]
    async fn next_resolves_on_push() {
        let chain = EventChain::new(text("a", Source::Api));
        let head = chain.current();

        let pending = head.next();
        drop(chain.push(text("b", Source::User)));

        let event = pending.await.unwrap();
        assert_eq!(delta_of(&event), r#"[insert "b"]"#);

        // An already-resolved link answers immediately.
        let again = head.next().await.unwrap();
        assert_eq!(delta_of(&again), r#"[insert "b"]"#);
    }

    #[tokio::test]
    async fn dropping_the_chain_errors_waiters() {
        let chain = EventChain::new(text("a", Source::Api));
        let head = chain.current();

        let pending = head.next();
        drop(chain);

        assert!(pending.await.is_err());
        assert!(head.next().await.is_err());
        assert!(head.next_now().is_none());
    }

    #[tokio::test]
    async fn synthesized_head_is_observed_before_later_events() {
        let chain = EventChain::new(text("a", Source::Api));
        let consumed = chain.current();

        // Splice a fabricated event, then let the editor emit more.
        let head = consumed.with_synthesized_next(text("synth", Source::User));
        drop(chain.push(text("later", Source::User)));

        let first = head.next_now().unwrap();
        assert_eq!(delta_of(&first), r#"[insert "synth"]"#);

        let second = first.next().await.unwrap();
        assert_eq!(delta_of(&second), r#"[insert "later"]"#);
    }

    #[test]
    fn synthesized_head_delegates_pending_links() {
        let chain = EventChain::new(text("a", Source::Api));
        let consumed = chain.current();

        let head = consumed.with_synthesized_next(text("synth", Source::User));
        let synth = head.next_now().unwrap();
        // Nothing emitted after the shadowed node yet.
        assert!(synth.next_now().is_none());

        drop(chain.push(text("later", Source::User)));
        assert!(synth.next_now().is_some());
    }
}

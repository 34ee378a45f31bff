//! Typed stubs over [`TargetProxy`] for the known target interfaces.
//!
//! The transport itself is method-name agnostic; these wrappers pin down
//! the vocabulary of the three server-side interfaces a client talks to:
//! the connection-level `meta` target, the author target unlocked by a
//! bearer token, and per-document session targets.

use derive_more::From;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracerr::Traced;

use calliope_client_api_proto::{
    CaretId, Change, ConnectionId, Delta, DocumentId, PropertyChange,
    PropertyDelta, PropertySnapshot, RevNum, Snapshot,
};

use crate::rpc::{CallError, Reply, TargetProxy};

type Result<T> = std::result::Result<T, Traced<CallError>>;

/// Decodes a plain-data [`Reply`] into the expected shape.
fn decode<T: DeserializeOwned>(reply: Reply) -> Result<T> {
    let value = reply.into_value()?;
    serde_json::from_value(value)
        .map_err(|e| tracerr::new!(CallError::InvalidReply(e.to_string())))
}

/// Stub for the `meta` target carrying connection-level operations.
///
/// Present on every connection; re-bound automatically after resets.
#[derive(Clone, Debug, From)]
pub struct MetaProxy(TargetProxy);

impl MetaProxy {
    /// Asks the server for the id it assigned to this connection.
    pub async fn connection_id(&self) -> Result<ConnectionId> {
        decode(self.0.call("connectionId", vec![]).await?)
    }

    /// Fetches the server's self-description blob.
    pub async fn server_info(&self) -> Result<Value> {
        self.0.call("serverInfo", vec![]).await?.into_value()
    }

    /// Round-trips a no-op through the server.
    pub async fn ping(&self) -> Result<Value> {
        self.0.call("ping", vec![]).await?.into_value()
    }
}

/// Stub for an author target, addressed via the author's bearer token.
#[derive(Clone, Debug, From)]
pub struct AuthorProxy(TargetProxy);

impl AuthorProxy {
    /// Looks up the still-live session for `(document, caret)`.
    ///
    /// Resolves to [`None`] when the caret has been evicted server-side and
    /// a fresh session has to be made instead.
    pub async fn find_existing_session(
        &self,
        document_id: &DocumentId,
        caret_id: &CaretId,
    ) -> Result<Option<SessionProxy>> {
        let reply = self
            .0
            .call(
                "findExistingSession",
                vec![json!(document_id), json!(caret_id)],
            )
            .await?;
        match reply {
            Reply::Target(proxy) => Ok(Some(SessionProxy(proxy))),
            Reply::Value(Value::Null) => Ok(None),
            Reply::Value(other) => {
                Err(tracerr::new!(CallError::InvalidReply(format!(
                    "expected a session target or null, got {}",
                    other,
                ))))
            }
        }
    }

    /// Creates a brand-new session (and caret) for the given document.
    pub async fn make_new_session(
        &self,
        document_id: &DocumentId,
    ) -> Result<SessionProxy> {
        self.0
            .call("makeNewSession", vec![json!(document_id)])
            .await?
            .into_target()
            .map(SessionProxy)
    }
}

/// Stub for one document-session target.
///
/// All document reads and writes of a single `(author, document, caret)`
/// identity go through here.
#[derive(Clone, Debug, From)]
pub struct SessionProxy(TargetProxy);

impl SessionProxy {
    /// Borrows the raw [`TargetProxy`] underneath, e.g. to check whether a
    /// connection still recognizes this proxy.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &TargetProxy {
        &self.0
    }

    /// Returns the caret id this session is bound to.
    pub async fn get_caret_id(&self) -> Result<CaretId> {
        decode(self.0.call("getCaretId", vec![]).await?)
    }

    /// Fetches the server-side logging context of this session.
    pub async fn get_log_info(&self) -> Result<Value> {
        self.0.call("getLogInfo", vec![]).await?.into_value()
    }

    /// Fetches the full current document body.
    pub async fn body_get_snapshot(&self) -> Result<Snapshot> {
        decode(self.0.call("body_getSnapshot", vec![]).await?)
    }

    /// Blocks server-side until a change past `base_rev` exists, then
    /// returns it.
    ///
    /// Expected to fail with the wire `timedOut` code on quiet documents;
    /// callers treat that as a benign poll-again signal.
    pub async fn body_get_change_after(
        &self,
        base_rev: RevNum,
    ) -> Result<Change> {
        decode(
            self.0
                .call("body_getChangeAfter", vec![json!(base_rev)])
                .await?,
        )
    }

    /// Submits a local change made against `base_rev`.
    ///
    /// The returned [`Change`] carries the resulting revision and the
    /// correction delta to rebase over (empty when nothing interleaved).
    pub async fn body_update(
        &self,
        base_rev: RevNum,
        delta: &Delta,
    ) -> Result<Change> {
        decode(
            self.0
                .call("body_update", vec![json!(base_rev), json!(delta)])
                .await?,
        )
    }

    /// Reports the author's caret position at the given revision.
    pub async fn caret_update(
        &self,
        rev_num: RevNum,
        index: usize,
        length: usize,
    ) -> Result<()> {
        drop(
            self.0
                .call(
                    "caret_update",
                    vec![json!(rev_num), json!(index), json!(length)],
                )
                .await?
                .into_value()?,
        );
        Ok(())
    }

    /// Fetches the full current property map.
    pub async fn property_get_snapshot(&self) -> Result<PropertySnapshot> {
        decode(self.0.call("property_getSnapshot", vec![]).await?)
    }

    /// Submits property mutations made against `rev_num`.
    pub async fn property_update(
        &self,
        rev_num: RevNum,
        delta: &PropertyDelta,
    ) -> Result<PropertyChange> {
        decode(
            self.0
                .call("property_update", vec![json!(rev_num), json!(delta)])
                .await?,
        )
    }

    /// Blocks server-side (up to `timeout_ms`) until a property change past
    /// `rev_num` exists, then returns it.
    pub async fn property_get_change_after(
        &self,
        rev_num: RevNum,
        timeout_ms: u64,
    ) -> Result<PropertyChange> {
        decode(
            self.0
                .call(
                    "property_getChangeAfter",
                    vec![json!(rev_num), json!(timeout_ms)],
                )
                .await?,
        )
    }
}

//! Durable session of one author on one document.
//!
//! [`DocSession`] hides connection churn from the layers above: it owns a
//! lazily-created [`WebSocketRpcClient`], resolves (and caches) the session
//! proxy of the current `(author, document, caret)` identity, and refreshes
//! it transparently when a reconnected transport no longer recognizes the
//! cached one.

use std::{cell::RefCell, rc::Rc};

use calliope_client_api_proto::{BearerToken, CaretId, DocumentId};
use derive_more::{Display, From};
use futures::{channel::mpsc, stream::LocalBoxStream, StreamExt as _};
use medea_reactive::ObservableCell;
use tracerr::Traced;

use crate::{
    platform::{self, RpcTransport, WebSocketRpcTransport},
    rpc::{
        ApiUrl, AuthorProxy, CallError, ClientState, RpcClientError,
        SessionProxy, WebSocketRpcClient,
    },
};

/// Errors raised while resolving or driving a [`DocSession`].
#[derive(Clone, Debug, Display, From, PartialEq)]
pub enum SessionError {
    /// Connection could not be opened.
    #[display(fmt = "{}", _0)]
    Rpc(RpcClientError),

    /// A call on the session failed.
    #[display(fmt = "{}", _0)]
    Call(CallError),

    /// The [`DocSession`] was dropped while being waited on.
    #[display(fmt = "document session has been dropped")]
    SessionGone,
}

impl SessionError {
    /// Indicates whether this error stems from connection trouble rather
    /// than from the server rejecting an operation.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Rpc(_) | Self::SessionGone => true,
            Self::Call(err) => err.is_connection(),
        }
    }
}

/// Connection-lifecycle event of a [`DocSession`].
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Transport is being opened.
    Opening,

    /// Transport is open.
    Open,

    /// Transport could not be opened, or closed.
    Closed,

    /// An error was reported against this session.
    Error(Rc<Traced<SessionError>>),
}

/// Identity a [`DocSession`] acts under.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Author credential unlocking the author target.
    pub author_token: BearerToken,

    /// Document being edited.
    pub document_id: DocumentId,

    /// Caret of this editor, once known. Learned from the server when a
    /// fresh session gets created.
    pub caret_id: Option<CaretId>,
}

/// Durable handle for the session of one `(author, document, caret)`.
pub struct DocSession {
    /// Identity this session acts under.
    info: RefCell<SessionInfo>,

    /// Builder of the underlying RPC client, invoked lazily.
    client_factory: Box<dyn Fn() -> Rc<WebSocketRpcClient>>,

    /// The RPC client, once built.
    client: RefCell<Option<Rc<WebSocketRpcClient>>>,

    /// Cached session proxy of the current connection.
    proxy: RefCell<Option<SessionProxy>>,

    /// Guard coalescing concurrent proxy lookups into one.
    busy: ObservableCell<bool>,

    /// Subscribers of [`DocSession::subscribe`].
    event_txs: RefCell<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl DocSession {
    /// Creates a new [`DocSession`] building its RPC clients with the given
    /// factory.
    #[must_use]
    pub fn new(
        info: SessionInfo,
        client_factory: Box<dyn Fn() -> Rc<WebSocketRpcClient>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            info: RefCell::new(info),
            client_factory,
            client: RefCell::new(None),
            proxy: RefCell::new(None),
            busy: ObservableCell::new(false),
            event_txs: RefCell::new(Vec::new()),
        })
    }

    /// Creates a [`DocSession`] talking to the given endpoint over the
    /// native WebSocket transport.
    #[must_use]
    pub fn with_native_transport(url: ApiUrl, info: SessionInfo) -> Rc<Self> {
        Self::new(
            info,
            Box::new(move || {
                WebSocketRpcClient::new(
                    url.clone(),
                    Box::new(|url| {
                        Box::pin(async move {
                            let transport =
                                WebSocketRpcTransport::new(&url).await?;
                            Ok(Rc::new(transport) as Rc<dyn RpcTransport>)
                        })
                    }),
                )
            }),
        )
    }

    /// Returns this session's current identity.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    /// Fire-and-forget best effort to get the transport opening.
    ///
    /// Failures are swallowed here on purpose: they resurface through
    /// [`DocSession::get_session_proxy`] and the event stream.
    pub fn open(self: &Rc<Self>) {
        let this = Rc::clone(self);
        platform::spawn(async move {
            if let Err(e) = this.ensure_open().await {
                log::info!("session: background open failed: {}", e);
            }
        });
    }

    /// Resolves the session proxy for the current identity.
    ///
    /// Idempotent: a cached proxy that the transport still recognizes is
    /// returned as-is; otherwise the session is looked up through the
    /// author target (or created afresh, adopting the new caret id).
    /// Concurrent callers coalesce onto a single in-flight resolution.
    ///
    /// # Errors
    ///
    /// With [`SessionError`] when the connection cannot be opened or the
    /// lookup calls fail.
    pub async fn get_session_proxy(
        self: &Rc<Self>,
    ) -> Result<SessionProxy, Traced<SessionError>> {
        while self.busy.get() {
            if self.busy.when_eq(false).await.is_err() {
                return Err(tracerr::new!(SessionError::SessionGone));
            }
        }
        self.busy.set(true);
        let result = self.resolve_proxy().await;
        self.busy.set(false);
        result
    }

    /// Broadcasts `error` on the event stream.
    pub fn report_error(&self, error: Rc<Traced<SessionError>>) {
        self.broadcast(SessionEvent::Error(error));
    }

    /// Subscribes to this session's [`SessionEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> LocalBoxStream<'static, SessionEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.event_txs.borrow_mut().push(tx);
        Box::pin(rx)
    }

    /// Returns the RPC client, building (and wiring) it on first use.
    fn client(self: &Rc<Self>) -> Rc<WebSocketRpcClient> {
        if let Some(client) = &*self.client.borrow() {
            return Rc::clone(client);
        }
        let client = (self.client_factory)();
        self.spawn_close_watcher(&client);
        *self.client.borrow_mut() = Some(Rc::clone(&client));
        client
    }

    /// Spawns the watcher translating client closes into [`SessionEvent`]s.
    fn spawn_close_watcher(
        self: &Rc<Self>,
        client: &Rc<WebSocketRpcClient>,
    ) {
        let mut state_changes = client.subscribe_state();
        let weak_this = Rc::downgrade(self);
        platform::spawn(async move {
            let mut was_open = false;
            while let Some(state) = state_changes.next().await {
                let this = match weak_this.upgrade() {
                    Some(this) => this,
                    None => break,
                };
                match state {
                    ClientState::Open => was_open = true,
                    ClientState::Closed if was_open => {
                        was_open = false;
                        this.broadcast(SessionEvent::Closed);
                    }
                    _ => (),
                }
            }
        });
    }

    /// Opens the transport, emitting lifecycle events when an actual
    /// transition happens.
    async fn ensure_open(
        self: &Rc<Self>,
    ) -> Result<Rc<WebSocketRpcClient>, Traced<SessionError>> {
        let client = self.client();
        if client.state() == ClientState::Open {
            return Ok(client);
        }
        self.broadcast(SessionEvent::Opening);
        match Rc::clone(&client).open().await {
            Ok(()) => {
                self.broadcast(SessionEvent::Open);
                Ok(client)
            }
            Err(e) => {
                self.broadcast(SessionEvent::Closed);
                Err(e).map_err(tracerr::map_from_and_wrap!())
            }
        }
    }

    /// The actual resolution behind [`DocSession::get_session_proxy`].
    async fn resolve_proxy(
        self: &Rc<Self>,
    ) -> Result<SessionProxy, Traced<SessionError>> {
        let client = self.ensure_open().await?;

        let cached = self.proxy.borrow().clone();
        if let Some(proxy) = cached {
            if client.handles(proxy.raw()) {
                return Ok(proxy);
            }
            log::debug!("session: cached proxy is stale, re-resolving");
            *self.proxy.borrow_mut() = None;
        }

        let info = self.info();
        let author =
            AuthorProxy::from(client.get_proxy(info.author_token.target_id()));

        let existing = match &info.caret_id {
            Some(caret_id) => author
                .find_existing_session(&info.document_id, caret_id)
                .await
                .map_err(tracerr::map_from_and_wrap!())?,
            None => None,
        };
        let proxy = match existing {
            Some(proxy) => proxy,
            // No caret yet, or the server evicted it: start over.
            None => self.make_new_session(&author, &info.document_id).await?,
        };

        *self.proxy.borrow_mut() = Some(proxy.clone());
        Ok(proxy)
    }

    /// Creates a fresh session, adopting the caret id it was given.
    async fn make_new_session(
        &self,
        author: &AuthorProxy,
        document_id: &DocumentId,
    ) -> Result<SessionProxy, Traced<SessionError>> {
        let proxy = author
            .make_new_session(document_id)
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        let caret_id = proxy
            .get_caret_id()
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        log::debug!("session: created new session with caret {}", caret_id);
        self.info.borrow_mut().caret_id = Some(caret_id);
        Ok(proxy)
    }

    /// Broadcasts `event` to every subscriber.
    fn broadcast(&self, event: SessionEvent) {
        self.event_txs
            .borrow_mut()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

//! Client end of the RPC connection: socket lifecycle, message/response
//! correlation and target bookkeeping.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use calliope_client_api_proto::{
    CodedError, ConnectionId, Functor, Message, Remote, Response, ServerFrame,
    TargetId,
};
use futures::{
    channel::oneshot,
    future::{self, LocalBoxFuture},
    stream::LocalBoxStream,
    StreamExt as _, TryFutureExt as _,
};
use medea_reactive::ObservableCell;
use serde_json::Value;
use tracerr::Traced;

use crate::{
    platform::{self, RpcTransport, TransportError, TransportState},
    rpc::{
        targets::SendFn, ApiUrl, CallError, CloseMsg, ConnectionError,
        MetaProxy, Reply, RpcClientError, TargetProxy, Targets,
    },
};

/// Id of the always-present connection-level target.
const META_TARGET: &str = "meta";

/// Method name of the server's soft-close notification.
const CLOSE_METHOD: &str = "close";

/// Factory closure producing a [`platform::RpcTransport`] for each
/// connection attempt.
pub type TransportFactory = Box<
    dyn Fn(
        ApiUrl,
    ) -> LocalBoxFuture<
        'static,
        Result<Rc<dyn RpcTransport>, Traced<TransportError>>,
    >,
>;

/// State of a [`WebSocketRpcClient`] connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    /// `open()` has never been called.
    Unopened,

    /// Connection establishment or handshake is in progress. Sends are
    /// queued and flushed, in id order, once the socket opens.
    Connecting,

    /// Connection is up; sends are written immediately.
    Open,

    /// Server announced a soft close. New sends are rejected while replies
    /// to earlier sends keep arriving until the socket actually closes.
    ServerClosing,

    /// Connection is closed. A fresh `open()` performs a new handshake.
    Closed,
}

/// Waiter for one in-flight call.
struct PendingCall {
    /// Resolver of the caller's future.
    tx: oneshot::Sender<Result<Reply, Traced<CallError>>>,

    /// Method name, kept for log lines at teardown.
    method: String,
}

/// Inner state of [`WebSocketRpcClient`].
struct Inner {
    /// Transport connection with the server.
    sock: Option<Rc<dyn RpcTransport>>,

    /// Closure producing fresh transports for each connection attempt.
    transport_factory: TransportFactory,

    /// URL this client connects to.
    url: ApiUrl,

    /// Server-assigned id of the current connection.
    connection_id: ConnectionId,

    /// Self-description returned by the server during the handshake.
    server_info: Option<Value>,

    /// Next outbound message id.
    next_id: u64,

    /// Waiters of in-flight calls, keyed by message id.
    calls: HashMap<u64, PendingCall>,

    /// Messages queued while the connection is being established.
    queue: Vec<Message>,

    /// Targets known to the current connection.
    targets: Targets,

    /// Current connection state.
    state: ObservableCell<ClientState>,
}

/// Client end of one RPC connection to the Calliope server.
///
/// Owns the WebSocket lifecycle, assigns message ids, correlates responses
/// to waiters and hosts the target registry. The `meta` target is always
/// bound, and is re-bound as part of every connection reset.
pub struct WebSocketRpcClient(RefCell<Inner>);

impl WebSocketRpcClient {
    /// Creates a new [`WebSocketRpcClient`] that will connect to `url` with
    /// transports produced by `transport_factory`.
    #[must_use]
    pub fn new(url: ApiUrl, transport_factory: TransportFactory) -> Rc<Self> {
        let this = Rc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let send: SendFn = Rc::new(move |target, functor| {
                match weak.upgrade() {
                    Some(client) => client.do_send(target, functor),
                    None => Box::pin(future::err(tracerr::new!(
                        CallError::ClientGone
                    ))),
                }
            });
            Self(RefCell::new(Inner {
                sock: None,
                transport_factory,
                url,
                connection_id: ConnectionId::unknown(),
                server_info: None,
                next_id: 0,
                calls: HashMap::new(),
                queue: Vec::new(),
                targets: Targets::new(send),
                state: ObservableCell::new(ClientState::Unopened),
            }))
        });
        drop(this.0.borrow().targets.add_or_get(TargetId::from(META_TARGET)));
        this
    }

    /// Brings this client into [`ClientState::Open`].
    ///
    /// Idempotent: an already-open client resolves immediately, and a
    /// client in the middle of opening awaits that attempt by issuing a
    /// duplicate-tolerant `meta.ping()`. Otherwise a fresh transport is
    /// created and the handshake (`meta.connectionId()` +
    /// `meta.serverInfo()`, issued concurrently) is performed; the returned
    /// connection id is adopted as this client's id.
    ///
    /// # Errors
    ///
    /// - [`RpcClientError::CouldNotEstablish`] if the transport factory
    ///   fails;
    /// - [`RpcClientError::Handshake`] if either handshake call fails;
    /// - [`RpcClientError::SoftClosing`] while the server is closing the
    ///   current connection.
    pub async fn open(self: Rc<Self>) -> Result<(), Traced<RpcClientError>> {
        let state = self.state();
        match state {
            ClientState::Open => Ok(()),
            ClientState::Connecting => {
                drop(
                    self.meta()
                        .ping()
                        .await
                        .map_err(tracerr::map_from_and_wrap!())?,
                );
                Ok(())
            }
            ClientState::ServerClosing => {
                Err(tracerr::new!(RpcClientError::SoftClosing(
                    self.connection_id()
                )))
            }
            ClientState::Unopened | ClientState::Closed => {
                self.establish().await
            }
        }
    }

    /// Indicates whether this client is usable for sends, i.e. open or in
    /// the process of opening.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ClientState::Connecting | ClientState::Open
        )
    }

    /// Returns the current [`ClientState`].
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.0.borrow().state.borrow().clone()
    }

    /// Subscribes to [`ClientState`] changes.
    #[must_use]
    pub fn subscribe_state(&self) -> LocalBoxStream<'static, ClientState> {
        self.0.borrow().state.subscribe()
    }

    /// Returns the id the server assigned to the current connection, or
    /// the `unknown` placeholder outside of one.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.0.borrow().connection_id.clone()
    }

    /// Returns the server's self-description from the handshake, if any.
    #[must_use]
    pub fn server_info(&self) -> Option<Value> {
        self.0.borrow().server_info.clone()
    }

    /// Returns the proxy of the always-present `meta` target.
    #[must_use]
    pub fn meta(&self) -> MetaProxy {
        MetaProxy::from(
            self.0.borrow().targets.add_or_get(TargetId::from(META_TARGET)),
        )
    }

    /// Returns a proxy for the given target id (or bearer token, which is
    /// accepted wherever a target id is), binding it if needed.
    #[must_use]
    pub fn get_proxy<I: Into<TargetId>>(&self, id: I) -> TargetProxy {
        self.0.borrow().targets.add_or_get(id.into())
    }

    /// Indicates whether the given proxy belongs to the current connection.
    ///
    /// Proxies from before a reset are not recognized anymore.
    #[must_use]
    pub fn handles(&self, proxy: &TargetProxy) -> bool {
        self.0.borrow().targets.handles(proxy)
    }

    /// Establishes a fresh transport connection and performs the handshake.
    async fn establish(self: Rc<Self>) -> Result<(), Traced<RpcClientError>> {
        let create = {
            let inner = self.0.borrow();
            inner.state.set(ClientState::Connecting);
            (inner.transport_factory)(inner.url.clone())
        };
        let transport = match create.await {
            Ok(transport) => transport,
            Err(e) => {
                self.0.borrow().state.set(ClientState::Closed);
                return Err(e).map_err(tracerr::map_from_and_wrap!());
            }
        };

        // Frames must be routed before anything is written, otherwise a
        // fast response could race the waiter registration.
        self.spawn_frame_listener(&transport);
        self.spawn_close_listener(&transport);

        let queued = {
            let mut inner = self.0.borrow_mut();
            inner.sock = Some(Rc::clone(&transport));
            inner.state.set(ClientState::Open);
            std::mem::take(&mut inner.queue)
        };
        for msg in queued {
            if let Err(e) = transport.send(&msg) {
                log::error!("rpc: failed to flush queued message: {}", e);
                self.reject_call(
                    msg.id,
                    ConnectionError::Failed(self.connection_id()),
                );
            }
        }

        let meta = self.meta();
        let handshake =
            future::try_join(meta.connection_id(), meta.server_info()).await;
        let (connection_id, server_info) = match handshake {
            Ok(hello) => hello,
            Err(e) => {
                // A connection that cannot introduce itself is unusable;
                // tear it down so `open()` may be retried from scratch.
                self.handle_close(&CloseMsg::Abnormal(String::from(
                    "handshake failed",
                )));
                return Err(e).map_err(tracerr::map_from_and_wrap!());
            }
        };
        {
            let mut inner = self.0.borrow_mut();
            inner.connection_id = connection_id;
            inner.server_info = Some(server_info);
        }
        log::info!("rpc[{}]: connection open", self.connection_id());

        Ok(())
    }

    /// Spawns the task dispatching inbound frames of `transport`.
    fn spawn_frame_listener(self: &Rc<Self>, transport: &Rc<dyn RpcTransport>) {
        let mut frames = transport.on_frame();
        let weak_this = Rc::downgrade(self);
        platform::spawn(async move {
            while let Some(frame) = frames.next().await {
                match weak_this.upgrade() {
                    Some(this) => this.handle_frame(frame),
                    None => break,
                }
            }
        });
    }

    /// Spawns the task watching `transport` for its close.
    fn spawn_close_listener(self: &Rc<Self>, transport: &Rc<dyn RpcTransport>) {
        let mut state_changes = transport.on_state_change();
        let weak_this = Rc::downgrade(self);
        platform::spawn(async move {
            while let Some(state) = state_changes.next().await {
                if let TransportState::Closed(msg) = state {
                    if let Some(this) = weak_this.upgrade() {
                        this.handle_close(&msg);
                    }
                    break;
                }
            }
        });
    }

    /// Turns an invocation into an in-flight call on this connection.
    ///
    /// The waiter is registered under the reserved id *before* the message
    /// is written, so an arriving response can never miss its entry.
    fn do_send(
        &self,
        target: TargetId,
        payload: Functor,
    ) -> LocalBoxFuture<'static, Result<Reply, Traced<CallError>>> {
        let rx = {
            let mut inner = self.0.borrow_mut();

            let state = inner.state.borrow().clone();
            match state {
                ClientState::Unopened | ClientState::Closed => {
                    return Box::pin(future::err(tracerr::new!(
                        CallError::Connection(ConnectionError::Closed {
                            connection_id: inner.connection_id.clone(),
                            detail: String::from("Already closed."),
                        })
                    )));
                }
                ClientState::ServerClosing => {
                    return Box::pin(future::err(tracerr::new!(
                        CallError::Connection(ConnectionError::Closing(
                            inner.connection_id.clone()
                        ))
                    )));
                }
                ClientState::Connecting | ClientState::Open => (),
            }

            if !inner.targets.contains(&target) {
                return Box::pin(future::err(tracerr::new!(
                    CallError::Connection(ConnectionError::UnknownTarget {
                        connection_id: inner.connection_id.clone(),
                        target,
                    })
                )));
            }

            let id = inner.next_id;
            inner.next_id += 1;

            let (tx, rx) = oneshot::channel();
            drop(inner.calls.insert(
                id,
                PendingCall {
                    tx,
                    method: payload.name.clone(),
                },
            ));
            let msg = Message {
                id,
                target,
                payload,
            };

            match state {
                ClientState::Connecting => {
                    inner.queue.push(msg);
                }
                ClientState::Open => {
                    let sock = inner.sock.clone();
                    drop(inner);
                    if let Some(sock) = sock {
                        if let Err(e) = sock.send(&msg) {
                            log::error!("rpc: failed to write message: {}", e);
                            self.reject_call(
                                msg.id,
                                ConnectionError::Failed(self.connection_id()),
                            );
                        }
                    }
                }
                _ => unreachable!("non-sendable states bailed out above"),
            }

            rx
        };

        Box::pin(rx.unwrap_or_else(|_| {
            Err(tracerr::new!(CallError::ClientGone))
        }))
    }

    /// Rejects the in-flight call with the given id, if it still waits.
    fn reject_call(&self, id: u64, error: ConnectionError) {
        let pending = self.0.borrow_mut().calls.remove(&id);
        if let Some(call) = pending {
            drop(
                call.tx
                    .send(Err(tracerr::new!(CallError::Connection(error)))),
            );
        }
    }

    /// Handles one inbound frame.
    fn handle_frame(self: &Rc<Self>, frame: ServerFrame) {
        match frame {
            ServerFrame::Response(response) => self.handle_response(response),
            ServerFrame::Message(msg) => {
                if msg.target.0 == META_TARGET
                    && msg.payload.name == CLOSE_METHOD
                {
                    self.handle_soft_close();
                } else {
                    log::warn!(
                        "rpc[{}]: discarding unexpected server message \
                         {}.{}",
                        self.connection_id(),
                        msg.target,
                        msg.payload,
                    );
                }
            }
        }
    }

    /// Routes a [`Response`] to the waiter registered under its id.
    fn handle_response(self: &Rc<Self>, response: Response) {
        let id = response.id;
        let pending = self.0.borrow_mut().calls.remove(&id);
        let call = match pending {
            Some(call) => call,
            None => {
                log::warn!(
                    "rpc[{}]: orphan response with id {}",
                    self.connection_id(),
                    id,
                );
                return;
            }
        };

        let result = match response.into_payload() {
            Err(error) => {
                let wrapped =
                    CodedError::remote_error(&self.connection_id(), error);
                Err(tracerr::new!(CallError::Remote(wrapped)))
            }
            Ok(value) => match Remote::from_value(&value) {
                Some(remote) => Ok(Reply::Target(
                    self.0.borrow().targets.add_or_get(remote.target_id),
                )),
                None => Ok(Reply::Value(value)),
            },
        };

        if call.tx.send(result).is_err() {
            log::debug!(
                "rpc[{}]: waiter of {} (id {}) is gone",
                self.connection_id(),
                call.method,
                id,
            );
        }
    }

    /// Handles the server's in-band `meta.close` notification.
    fn handle_soft_close(&self) {
        let inner = self.0.borrow();
        let state = inner.state.borrow().clone();
        if matches!(state, ClientState::Connecting | ClientState::Open) {
            log::info!(
                "rpc[{}]: server is closing the connection",
                inner.connection_id,
            );
            inner.state.set(ClientState::ServerClosing);
        }
    }

    /// Handles the transport going away: rejects every in-flight call and
    /// resets this client so that `open()` may be called again.
    fn handle_close(&self, close: &CloseMsg) {
        let (error, waiters, connection_id) = {
            let mut inner = self.0.borrow_mut();
            let connection_id = inner.connection_id.clone();
            let error = match close {
                CloseMsg::Normal { code, reason } => ConnectionError::Closed {
                    connection_id: connection_id.clone(),
                    detail: format!("{}:{}", code, reason),
                },
                CloseMsg::Abnormal(_) => {
                    ConnectionError::Failed(connection_id.clone())
                }
            };

            // Drain into a snapshot first: a reject may synchronously
            // re-enter `send`, which must observe fully reset state.
            let waiters: Vec<PendingCall> =
                inner.calls.drain().map(|(_, call)| call).collect();

            inner.sock = None;
            inner.connection_id = ConnectionId::unknown();
            inner.server_info = None;
            inner.next_id = 0;
            inner.queue.clear();
            inner.targets.clear();
            drop(inner.targets.add_or_get(TargetId::from(META_TARGET)));
            inner.state.set(ClientState::Closed);

            (error, waiters, connection_id)
        };

        log::info!(
            "rpc[{}]: connection closed ({:?}), rejecting {} pending calls",
            connection_id,
            close,
            waiters.len(),
        );
        for call in waiters {
            log::debug!(
                "rpc[{}]: rejecting pending {}",
                connection_id,
                call.method,
            );
            drop(
                call.tx.send(Err(tracerr::new!(CallError::Connection(
                    error.clone()
                )))),
            );
        }
    }
}

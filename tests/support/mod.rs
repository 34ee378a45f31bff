//! Shared test doubles: an in-memory transport, a scripted server behind
//! it, and a fake editor with a real event chain.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use futures::{channel::mpsc, stream::LocalBoxStream};
use medea_reactive::ObservableCell;
use serde_json::{json, Value};
use tracerr::Traced;

use calliope_scribe::{
    doc::{DocSession, SessionInfo},
    editor::{ClientEvent, Editor, EventChain, EventPayload, Range, Source},
    platform::{RpcTransport, TransportError, TransportState},
    proto::{
        CodedError, Delta, Message, PropertyChange, PropertyDelta,
        PropertyOp, PropertySnapshot, Remote, Response, RevNum, ServerFrame,
        Snapshot, TargetId,
    },
    rpc::{ApiUrl, CloseMsg, TransportFactory, WebSocketRpcClient},
};

pub type Responder = Box<dyn FnMut(&Message) -> Option<ServerFrame>>;

/// In-memory [`RpcTransport`]: records sends, lets tests inject frames and
/// close the "socket", and optionally answers sends through a responder.
pub struct FakeTransport {
    state: ObservableCell<TransportState>,
    sent: RefCell<Vec<Message>>,
    subs: RefCell<Vec<mpsc::UnboundedSender<ServerFrame>>>,
    responder: RefCell<Option<Responder>>,
}

impl FakeTransport {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: ObservableCell::new(TransportState::Open),
            sent: RefCell::new(Vec::new()),
            subs: RefCell::new(Vec::new()),
            responder: RefCell::new(None),
        })
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.borrow_mut() = Some(responder);
    }

    /// Every message written into this transport so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.borrow().clone()
    }

    /// Injects an inbound frame.
    pub fn push_frame(&self, frame: ServerFrame) {
        self.subs
            .borrow_mut()
            .retain(|sub| sub.unbounded_send(frame.clone()).is_ok());
    }

    pub fn respond_ok(&self, id: u64, result: Value) {
        self.push_frame(ServerFrame::Response(Response::ok(id, result)));
    }

    pub fn respond_err(&self, id: u64, error: CodedError) {
        self.push_frame(ServerFrame::Response(Response::error(id, error)));
    }

    /// Simulates the socket closing.
    pub fn close(&self, msg: CloseMsg) {
        self.state.set(TransportState::Closed(msg));
    }
}

impl RpcTransport for FakeTransport {
    fn on_frame(&self) -> LocalBoxStream<'static, ServerFrame> {
        let (tx, rx) = mpsc::unbounded();
        self.subs.borrow_mut().push(tx);
        Box::pin(rx)
    }

    fn send(&self, msg: &Message) -> Result<(), Traced<TransportError>> {
        if matches!(&*self.state.borrow(), TransportState::Closed(_)) {
            return Err(tracerr::new!(TransportError::ClosedSocket));
        }
        self.sent.borrow_mut().push(msg.clone());
        let frame = {
            let mut responder = self.responder.borrow_mut();
            responder.as_mut().and_then(|respond| respond(msg))
        };
        if let Some(frame) = frame {
            self.push_frame(frame);
        }
        Ok(())
    }

    fn on_state_change(&self) -> LocalBoxStream<'static, TransportState> {
        self.state.subscribe()
    }
}

/// Server-side state driving the scripted responder.
pub struct ServerScript {
    pub connection_id: String,
    pub snapshot: Snapshot,
    /// Whether `findExistingSession` finds the caret still alive.
    pub session_alive: bool,
    pub sessions_made: u32,
    pub caret_updates: Vec<Vec<Value>>,
    pub properties: PropertySnapshot,
    pub property_updates: Vec<Vec<Value>>,
    /// Long-poll and update calls parked for the test to answer.
    pub deferred: Vec<Message>,
}

impl ServerScript {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            connection_id: String::from("c-42"),
            snapshot,
            session_alive: false,
            sessions_made: 0,
            caret_updates: Vec::new(),
            properties: PropertySnapshot::default(),
            property_updates: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

/// Responder scripting the whole server conversation of a document session.
pub fn scripted_responder(script: Rc<RefCell<ServerScript>>) -> Responder {
    Box::new(move |msg| {
        let mut script = script.borrow_mut();
        let id = msg.id;
        let ok = |value: Value| {
            Some(ServerFrame::Response(Response::ok(id, value)))
        };
        match msg.payload.name.as_str() {
            "connectionId" => {
                let connection_id = script.connection_id.clone();
                ok(json!(connection_id))
            }
            "serverInfo" => ok(json!({ "version": 1 })),
            "ping" => ok(json!("pong")),
            "findExistingSession" => {
                if script.session_alive {
                    ok(session_remote().to_value())
                } else {
                    ok(Value::Null)
                }
            }
            "makeNewSession" => {
                script.sessions_made += 1;
                script.session_alive = true;
                ok(session_remote().to_value())
            }
            "getCaretId" => ok(json!("caret-1")),
            "getLogInfo" => ok(json!({ "document": "doc-1" })),
            "body_getSnapshot" => {
                let snapshot = serde_json::to_value(&script.snapshot).unwrap();
                ok(snapshot)
            }
            "caret_update" => {
                script.caret_updates.push(msg.payload.args.clone());
                ok(Value::Null)
            }
            "property_getSnapshot" => {
                ok(serde_json::to_value(&script.properties).unwrap())
            }
            "property_update" => {
                script.property_updates.push(msg.payload.args.clone());
                let delta: PropertyDelta =
                    serde_json::from_value(msg.payload.args[1].clone())
                        .unwrap();
                for op in &delta.0 {
                    match op {
                        PropertyOp::Set { name, value } => {
                            drop(
                                script
                                    .properties
                                    .properties
                                    .insert(name.clone(), value.clone()),
                            );
                        }
                        PropertyOp::Delete { name } => {
                            drop(script.properties.properties.remove(name));
                        }
                    }
                }
                script.properties.rev_num =
                    RevNum(script.properties.rev_num.0 + 1);
                let change = PropertyChange {
                    rev_num: script.properties.rev_num,
                    delta,
                };
                ok(serde_json::to_value(&change).unwrap())
            }
            "body_getChangeAfter" | "body_update"
            | "property_getChangeAfter" => {
                script.deferred.push(msg.clone());
                None
            }
            other => panic!("scripted server got unexpected method {}", other),
        }
    })
}

fn session_remote() -> Remote {
    Remote {
        target_id: TargetId::from("s-1"),
    }
}

/// A scripted server reachable through any number of consecutive fake
/// transports (one per connection attempt).
pub struct TestServer {
    pub script: Rc<RefCell<ServerScript>>,
    pub transports: Rc<RefCell<Vec<Rc<FakeTransport>>>>,
}

impl TestServer {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            script: Rc::new(RefCell::new(ServerScript::new(snapshot))),
            transports: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Transport factory handing out a fresh scripted transport per
    /// connection attempt.
    pub fn transport_factory(&self) -> TransportFactory {
        let script = Rc::clone(&self.script);
        let transports = Rc::clone(&self.transports);
        Box::new(move |_url| {
            let script = Rc::clone(&script);
            let transports = Rc::clone(&transports);
            Box::pin(async move {
                let transport = FakeTransport::new();
                transport.set_responder(scripted_responder(script));
                transports.borrow_mut().push(Rc::clone(&transport));
                Ok(Rc::clone(&transport) as Rc<dyn RpcTransport>)
            })
        })
    }

    /// RPC client connected to this server.
    pub fn client(&self) -> Rc<WebSocketRpcClient> {
        WebSocketRpcClient::new(test_url(), self.transport_factory())
    }

    /// Document session riding on this server.
    pub fn doc_session(&self) -> Rc<DocSession> {
        let script = Rc::clone(&self.script);
        let transports = Rc::clone(&self.transports);
        DocSession::new(
            SessionInfo {
                author_token: "token-1".into(),
                document_id: "doc-1".into(),
                caret_id: None,
            },
            Box::new(move || {
                let server = TestServer {
                    script: Rc::clone(&script),
                    transports: Rc::clone(&transports),
                };
                WebSocketRpcClient::new(test_url(), server.transport_factory())
            }),
        )
    }

    /// The transport of the most recent connection attempt.
    pub fn latest_transport(&self) -> Rc<FakeTransport> {
        Rc::clone(self.transports.borrow().last().expect("no transport yet"))
    }

    /// Removes and returns the first parked call of the given method.
    pub fn take_call(&self, method: &str) -> Option<Message> {
        let mut script = self.script.borrow_mut();
        let position = script
            .deferred
            .iter()
            .position(|msg| msg.payload.name == method)?;
        Some(script.deferred.remove(position))
    }

    /// Waits until a call of the given method gets parked.
    pub async fn wait_call(&self, method: &str) -> Message {
        for _ in 0..2000 {
            if let Some(msg) = self.take_call(method) {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no {} call arrived", method);
    }

    /// Number of currently parked calls of the given method.
    pub fn parked_count(&self, method: &str) -> usize {
        self.script
            .borrow()
            .deferred
            .iter()
            .filter(|msg| msg.payload.name == method)
            .count()
    }

    /// Answers a parked call successfully over the latest transport.
    pub fn reply_ok<T: serde::Serialize>(&self, msg: &Message, result: &T) {
        self.latest_transport()
            .respond_ok(msg.id, serde_json::to_value(result).unwrap());
    }

    /// Answers a parked call with an error over the latest transport.
    pub fn reply_err(&self, msg: &Message, error: CodedError) {
        self.latest_transport().respond_err(msg.id, error);
    }
}

/// Editor double with a real event chain over a plain-text document.
pub struct FakeEditor {
    chain: EventChain,
    text: RefCell<String>,
    selection: Cell<Option<Range>>,
    pub enabled: Cell<bool>,
    pub focused: Cell<u32>,
    pub cutoffs: Cell<u32>,
    pub history_clears: Cell<u32>,
}

impl FakeEditor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            chain: EventChain::new(EventPayload::TextChange {
                delta: Delta::new(),
                old_contents: Delta::new(),
                source: Source::Api,
            }),
            text: RefCell::new(String::new()),
            selection: Cell::new(None),
            enabled: Cell::new(false),
            focused: Cell::new(0),
            cutoffs: Cell::new(0),
            history_clears: Cell::new(0),
        })
    }

    /// Simulates the user typing the given change.
    pub fn type_text(&self, delta: Delta) {
        self.apply(&delta, Source::User);
    }

    /// Simulates the user moving the caret.
    pub fn move_caret(&self, range: Range) {
        let old_range = self.selection.replace(Some(range));
        drop(self.chain.push(EventPayload::SelectionChange {
            range: Some(range),
            old_range,
            source: Source::User,
        }));
    }

    /// Current plain-text contents.
    pub fn text(&self) -> String {
        self.text.borrow().clone()
    }

    fn apply(&self, delta: &Delta, source: Source) {
        let old = self.contents();
        let updated = delta
            .apply_to(&self.text.borrow())
            .expect("delta does not fit the editor contents");
        *self.text.borrow_mut() = updated;
        drop(self.chain.push(EventPayload::TextChange {
            delta: delta.clone(),
            old_contents: old,
            source,
        }));
    }
}

impl Editor for FakeEditor {
    fn contents(&self) -> Delta {
        let text = self.text.borrow();
        if text.is_empty() {
            Delta::new()
        } else {
            Delta::new().insert(text.as_str())
        }
    }

    fn set_contents(&self, contents: Delta, source: Source) {
        let old = self.contents();
        *self.text.borrow_mut() =
            contents.apply_to("").expect("contents delta must be insert-only");
        drop(self.chain.push(EventPayload::TextChange {
            delta: contents,
            old_contents: old,
            source,
        }));
    }

    fn update_contents(&self, delta: Delta, source: Source) {
        self.apply(&delta, source);
    }

    fn selection(&self) -> Option<Range> {
        self.selection.get()
    }

    fn set_selection(&self, range: Range) {
        self.selection.set(Some(range));
    }

    fn enable(&self) {
        self.enabled.set(true);
    }

    fn disable(&self) {
        self.enabled.set(false);
    }

    fn focus(&self) {
        self.focused.set(self.focused.get() + 1);
    }

    fn history_cutoff(&self) {
        self.cutoffs.set(self.cutoffs.get() + 1);
    }

    fn history_clear(&self) {
        self.history_clears.set(self.history_clears.get() + 1);
    }

    fn current_event(&self) -> ClientEvent {
        self.chain.current()
    }
}

pub fn test_url() -> ApiUrl {
    ApiUrl::from_endpoint("http://test.invalid/api").unwrap()
}

/// Lets every queued local task run without advancing the clock.
pub async fn settle() {
    for _ in 0..256 {
        tokio::task::yield_now().await;
    }
}

/// A snapshot of plain text at the given revision.
pub fn snapshot(rev: u64, text: &str) -> Snapshot {
    Snapshot {
        rev_num: RevNum(rev),
        contents: if text.is_empty() {
            Delta::new()
        } else {
            Delta::new().insert(text)
        },
    }
}

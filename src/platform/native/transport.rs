//! WebSocket transport on top of [`tokio_tungstenite`].

use std::{cell::RefCell, rc::Rc};

use calliope_client_api_proto::{Message, ServerFrame};
use futures::{
    channel::mpsc,
    stream::{LocalBoxStream, SplitSink, SplitStream},
    SinkExt as _, StreamExt as _,
};
use medea_reactive::ObservableCell;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{
        frame::coding::CloseCode, CloseFrame, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracerr::Traced;

use crate::{
    platform::transport::{RpcTransport, TransportError, TransportState},
    rpc::{ApiUrl, CloseMsg},
    utils::TaskHandle,
};

type Result<T, E = Traced<TransportError>> = std::result::Result<T, E>;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct InnerSocket {
    /// Sender feeding the writer task.
    ///
    /// Dropping it is what closes the socket: the writer drains its queue,
    /// sends a normal close frame and ends.
    write_tx: mpsc::UnboundedSender<String>,

    /// State of the connection.
    socket_state: ObservableCell<TransportState>,

    /// Subscribers of [`RpcTransport::on_frame`].
    on_frame_subs: Vec<mpsc::UnboundedSender<ServerFrame>>,

    /// Reader task, aborted when this socket is dropped.
    _reader: Option<TaskHandle>,
}

/// WebSocket [`RpcTransport`] between a client and a server.
pub struct WebSocketRpcTransport(Rc<RefCell<InnerSocket>>);

impl WebSocketRpcTransport {
    /// Initiates a new WebSocket connection. Resolves only once the
    /// underlying connection is established.
    ///
    /// # Errors
    ///
    /// With [`TransportError::CreateSocket`] if the connection attempt to
    /// the given [`ApiUrl`] fails.
    pub async fn new(url: &ApiUrl) -> Result<Self> {
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::CreateSocket(e.to_string()))
            .map_err(tracerr::wrap!())?;
        let (sink, stream) = socket.split();

        let (write_tx, write_rx) = mpsc::unbounded();
        crate::platform::spawn(run_writer(sink, write_rx));

        let inner = Rc::new(RefCell::new(InnerSocket {
            write_tx,
            socket_state: ObservableCell::new(TransportState::Open),
            on_frame_subs: Vec::new(),
            _reader: None,
        }));

        let (reader, reader_handle) =
            futures::future::abortable(run_reader(stream, Rc::downgrade(&inner)));
        crate::platform::spawn(async move {
            drop(reader.await);
        });
        inner.borrow_mut()._reader = Some(reader_handle.into());

        Ok(Self(inner))
    }
}

/// Forwards queued outbound text frames into the socket sink.
///
/// When the queue side is dropped, sends a normal close frame so the server
/// sees an orderly goodbye.
async fn run_writer(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.next().await {
        if sink.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }
    drop(
        sink.send(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client going away".into(),
        })))
        .await,
    );
}

/// Pumps inbound socket messages into frame subscribers and tracks the
/// close of the connection.
async fn run_reader(
    mut stream: WsSource,
    inner: std::rc::Weak<RefCell<InnerSocket>>,
) {
    let mut close: Option<CloseMsg> = None;
    while let Some(msg) = stream.next().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        match msg {
            Ok(WsMessage::Text(text)) => {
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => {
                        inner.borrow_mut().on_frame_subs.retain(|sub| {
                            sub.unbounded_send(frame.clone()).is_ok()
                        });
                    }
                    Err(e) => {
                        log::error!("transport: undecodable frame: {}", e);
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                close = Some(frame.map_or(
                    CloseMsg::Normal {
                        code: 1005,
                        reason: String::new(),
                    },
                    |f| CloseMsg::Normal {
                        code: f.code.into(),
                        reason: f.reason.into_owned(),
                    },
                ));
            }
            Ok(_) => (),
            Err(e) => {
                if close.is_none() {
                    close = Some(CloseMsg::Abnormal(e.to_string()));
                }
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        let close = close
            .unwrap_or_else(|| CloseMsg::Abnormal(String::from("stream ended")));
        let inner = inner.borrow();
        inner.socket_state.set(TransportState::Closed(close));
    }
}

impl RpcTransport for WebSocketRpcTransport {
    fn on_frame(&self) -> LocalBoxStream<'static, ServerFrame> {
        let (tx, rx) = mpsc::unbounded();
        self.0.borrow_mut().on_frame_subs.push(tx);
        Box::pin(rx)
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let text = serde_json::to_string(msg)
            .map_err(|e| TransportError::SerializeMessage(e.into()))
            .map_err(tracerr::wrap!())?;

        let inner = self.0.borrow();
        if matches!(&*inner.socket_state.borrow(), TransportState::Closed(_)) {
            return Err(tracerr::new!(TransportError::ClosedSocket));
        }
        inner
            .write_tx
            .unbounded_send(text)
            .map_err(|_| tracerr::new!(TransportError::ClosedSocket))
    }

    fn on_state_change(&self) -> LocalBoxStream<'static, TransportState> {
        self.0.borrow().socket_state.subscribe()
    }
}

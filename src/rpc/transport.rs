//! WebSocket Transport Layer
//!
//! Single responsibility: Open a text-framed, full-duplex connection and
//! surface its events. No knowledge of envelopes, authentication, or
//! reconnection.
//!
//! Every (re)connect opens a brand-new transport through a [`Connector`].
//! The tokio-tungstenite implementation is [`WsConnector`]; [`MemoryConnector`]
//! hands the far end of each connection to the caller, which lets tests and
//! tooling play the node.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::RpcError;

type WsSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Something the socket reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame
    Frame(String),
    /// Orderly close, with the peer's reason if it gave one
    Closed(Option<String>),
    /// The socket failed
    Error(String),
}

/// Send half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<(), RpcError>;
    async fn close(&mut self);
}

/// Receive half of a connection.
///
/// After `Closed` or `Error` the stream is finished.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_event(&mut self) -> TransportEvent;
}

/// An open connection, already split for concurrent send/receive.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Transport, RpcError>;
}

/// tokio-tungstenite connector
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, RpcError> {
        debug!(url = %url, "Connecting to WebSocket");

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RpcError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Transport {
            sink: Box::new(WsSink { sink }),
            stream: Box::new(WsStream { stream }),
        })
    }
}

struct WsSink {
    sink: SplitSink<WsSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), RpcError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to send: {}", e)))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Error while closing WebSocket");
        }
    }
}

struct WsStream {
    stream: SplitStream<WsSocket>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Frame(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return TransportEvent::Frame(text),
                    Err(_) => {
                        debug!("Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return TransportEvent::Closed(frame.map(close_reason))
                }
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return TransportEvent::Error(format!("WebSocket error: {}", e)),
                None => return TransportEvent::Closed(None),
            }
        }
    }
}

fn close_reason(frame: CloseFrame<'_>) -> String {
    format!("{} ({})", frame.reason, u16::from(frame.code))
}

/// In-process connector whose far ends are handed out as [`MemoryPeer`]s.
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    attempts: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Returns the connector and the stream of accepted peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            attempts: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(AtomicUsize::new(0)),
        };
        (connector, accepted)
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Transport, RpcError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RpcError::Transport(format!("Connection to {} refused", url)));
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();

        self.peers
            .send(MemoryPeer {
                incoming: from_client,
                outgoing: to_client,
            })
            .map_err(|_| RpcError::Transport("No peer is accepting connections".into()))?;

        Ok(Transport {
            sink: Box::new(MemorySink { tx: Some(to_peer) }),
            stream: Box::new(MemoryStream { rx: from_peer }),
        })
    }
}

/// The node's end of an in-memory connection.
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Next frame from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Send a frame to the client. Returns false if the client is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(TransportEvent::Frame(text.into())).is_ok()
    }

    /// Close the connection from the node's side.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.outgoing.send(TransportEvent::Closed(Some(reason.into())));
    }

    /// Fail the connection with a socket error.
    pub fn fail(&self, error: impl Into<String>) {
        let _ = self.outgoing.send(TransportEvent::Error(error.into()));
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<(), RpcError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RpcError::Transport("Connection closed".into()))?;
        tx.send(text)
            .map_err(|_| RpcError::Transport("Peer went away".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_event(&mut self) -> TransportEvent {
        self.rx.recv().await.unwrap_or(TransportEvent::Closed(None))
    }
}

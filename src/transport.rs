use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{ReverbError, Result};

/// What a transport read yields.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// A text frame.
    Text(String),
    /// The peer closed the socket. Codes 1000/1001 are clean closes.
    Closed { code: Option<u16>, reason: String },
}

impl Incoming {
    pub fn is_clean_close(&self) -> bool {
        matches!(
            self,
            Incoming::Closed {
                code: Some(1000) | Some(1001),
                ..
            }
        )
    }
}

/// Live open/closed flag for a socket.
///
/// Flips to closed the moment a close frame, read failure, or write failure
/// is observed, independent of when the receive loop gets around to
/// returning. The connected-state predicate consults this in addition to the
/// controller's own state.
#[derive(Debug, Clone)]
pub(crate) struct TransportStatus(Arc<AtomicBool>);

impl TransportStatus {
    pub fn new_open() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Write half of an open socket. The controller is the single writer.
#[async_trait]
pub(crate) trait TransportSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self);
}

/// Read half of an open socket.
#[async_trait]
pub(crate) trait TransportStream: Send {
    async fn recv(&mut self) -> Result<Incoming>;
}

/// An established socket: split halves plus the shared status flag.
pub(crate) struct Session {
    pub sink: Box<dyn TransportSink>,
    pub stream: Box<dyn TransportStream>,
    pub status: TransportStatus,
}

/// Opens transport sessions. The production implementation speaks WebSocket
/// via tokio-tungstenite; tests substitute a scripted connector.
#[async_trait]
pub(crate) trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Session>;
}

/// tokio-tungstenite backed connector.
pub(crate) struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Session> {
        let (ws_stream, response) = connect_async(url).await?;
        debug!("websocket connected, response status {}", response.status());

        let (sink, stream) = ws_stream.split();
        let status = TransportStatus::new_open();

        Ok(Session {
            sink: Box::new(WsSink {
                sink,
                status: status.clone(),
            }),
            stream: Box::new(WsStream {
                stream,
                status: status.clone(),
            }),
            status,
        })
    }
}

type WsSinkHalf = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStreamHalf = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct WsSink {
    sink: WsSinkHalf,
    status: TransportStatus,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        if let Err(e) = self.sink.send(WsMessage::Text(text)).await {
            self.status.set_closed();
            return Err(ReverbError::Connection(format!("send failed: {e}")));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.flush().await;
        self.status.set_closed();
    }
}

struct WsStream {
    stream: WsStreamHalf,
    status: TransportStatus,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn recv(&mut self) -> Result<Incoming> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(Incoming::Text(text)),
                Some(Ok(WsMessage::Close(frame))) => {
                    self.status.set_closed();
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    return Ok(Incoming::Closed { code, reason });
                }
                // Control and binary frames carry nothing for the protocol
                // layer; tungstenite answers pings internally.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.status.set_closed();
                    return Err(ReverbError::Connection(format!("receive failed: {e}")));
                }
                None => {
                    self.status.set_closed();
                    return Ok(Incoming::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    });
                }
            }
        }
    }
}

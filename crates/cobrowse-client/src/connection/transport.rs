//! Transport seam between the connection manager and the wire.
//!
//! A [`Connector`] opens a [`Transport`]: a pair of channels carrying text
//! frames each way. The production [`WsConnector`] bridges a
//! `tokio-tungstenite` socket onto those channels with one writer task and
//! one reader task; tests substitute in-memory connectors.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use cobrowse_core::errors::ConnectionError;

/// Frame written by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingFrame {
    /// A JSON text frame.
    Text(String),
    /// Close the socket with a normal close code.
    Close,
}

/// Frame delivered to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingFrame {
    /// A JSON text frame.
    Text(String),
    /// The socket closed. Always the last frame of a transport.
    Closed {
        /// Whether the peer closed with a normal close code.
        clean: bool,
        /// Close reason or transport error text.
        reason: Option<String>,
    },
}

/// An open transport. Dropping `incoming` ends the reader; dropping
/// `outgoing` ends the writer.
#[derive(Debug)]
pub struct Transport {
    /// Frames to write.
    pub outgoing: mpsc::Sender<OutgoingFrame>,
    /// Frames read. A closed receiver without a `Closed` frame is an abnormal close.
    pub incoming: mpsc::Receiver<IncomingFrame>,
}

/// Opens transports to a URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport. Must not retry internally.
    async fn connect(&self, url: &str) -> Result<Transport, ConnectionError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    /// Connector whose frame queues hold `buffer` frames each way.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, ConnectionError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<OutgoingFrame>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<IncomingFrame>(self.buffer);

        let _writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutgoingFrame::Text(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            warn!(error = %e, "websocket write failed");
                            break;
                        }
                    }
                    OutgoingFrame::Close => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(close))).await;
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
            }
            debug!("websocket writer stopped");
        });

        let _reader = tokio::spawn(async move {
            let closed = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx
                            .send(IncomingFrame::Text(text.as_str().to_owned()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break IncomingFrame::Closed {
                            clean: frame.as_ref().is_some_and(|f| f.code == CloseCode::Normal),
                            reason: frame.map(|f| f.reason.as_str().to_owned()),
                        };
                    }
                    // Binary, ping, and pong frames carry nothing for us
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break IncomingFrame::Closed {
                            clean: false,
                            reason: Some(e.to_string()),
                        };
                    }
                    None => {
                        break IncomingFrame::Closed {
                            clean: false,
                            reason: None,
                        };
                    }
                }
            };
            let _ = in_tx.send(closed).await;
            debug!("websocket reader stopped");
        });

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

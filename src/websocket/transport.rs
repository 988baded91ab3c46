//! Byte-level transport beneath the connection actor.
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels carrying outbound
//! [`Frame`]s and inbound [`LinkEvent`]s. The real implementation wraps a
//! tokio-tungstenite stream; the in-memory one hands the server side of the
//! link to whoever holds the accept receiver.

use crate::error::{AppError, Result};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
};
use tracing::{debug, warn};

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Pong(Vec<u8>),
    /// Normal-closure close frame. The link is finished after this.
    Close,
}

/// Event read from the server side.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Text(String),
    /// Transport error. A `Closed` event follows when the error was fatal.
    Error(String),
    Closed(String),
}

/// An open duplex link.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to a URL.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<Link>>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<Link>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| AppError::ConnectionFailed(e.to_string()))?;
            debug!("WebSocket handshake complete");

            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

            // Writer task
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let result = match frame {
                        Frame::Text(text) => write.send(Message::Text(text)).await,
                        Frame::Pong(data) => write.send(Message::Pong(data)).await,
                        Frame::Close => {
                            let close = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client disconnect".into(),
                            };
                            if let Err(e) = write.send(Message::Close(Some(close))).await {
                                debug!("Close frame not delivered: {}", e);
                            }
                            break;
                        }
                    };
                    if let Err(e) = result {
                        warn!("WebSocket write failed: {}", e);
                        break;
                    }
                }
            });

            // Reader task
            let pong_tx = out_tx.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(LinkEvent::Text(text)).is_err() {
                                break "link dropped".to_string();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = pong_tx.send(Frame::Pong(data));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                            break e.to_string();
                        }
                        None => break "stream ended".to_string(),
                    }
                };
                let _ = in_tx.send(LinkEvent::Closed(reason));
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// Server half of an in-memory link.
pub struct ServerLink {
    /// Frames written by the client.
    pub incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerLink {
    /// Push a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(LinkEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Report a transport error without closing.
    pub fn send_error(&self, message: &str) -> bool {
        self.outgoing.send(LinkEvent::Error(message.to_string())).is_ok()
    }

    /// Drop the link from the server side.
    pub fn close(&self, reason: &str) {
        let _ = self.outgoing.send(LinkEvent::Closed(reason.to_string()));
    }

    /// Next text frame from the client. Pongs are skipped; `None` on close.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.incoming.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Pong(_) => continue,
                Frame::Close => return None,
            }
        }
    }
}

/// In-memory connector. Each successful connect yields a [`ServerLink`]
/// on the accept channel.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerLink>,
    refusals: AtomicU32,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerLink>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            refusals: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Fail the next `count` connect attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, _url: String) -> BoxFuture<'static, Result<Link>> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if refused {
            Err(AppError::ConnectionFailed("connection refused".to_string()))
        } else {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let server = ServerLink {
                incoming: out_rx,
                outgoing: in_tx,
            };
            match self.accepted.send(server) {
                Ok(()) => Ok(Link {
                    outbound: out_tx,
                    inbound: in_rx,
                }),
                Err(_) => Err(AppError::ConnectionFailed("no listener".to_string())),
            }
        };
        Box::pin(async move { result })
    }
}

//! Transport seam: how a connection cycle obtains a duplex text channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use beacon_common::error::TransportError;

/// Close code for a deliberate, clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the link vanished without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Why a connection cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn normal() -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: "Normal closure".to_string(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// Inbound item on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Closed(CloseInfo),
}

/// An open duplex channel. Dropping `outbound` asks the peer to close.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<Link, TransportError>;
}

/// Real WebSocket connector.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Link, TransportError> {
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        // Writer: forwards outbound text; sends a close frame once the
        // manager drops its sender.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        // Reader: translates WebSocket messages into frames.
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(Frame::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let info = match frame {
                            Some(frame) => CloseInfo {
                                code: u16::from(frame.code),
                                reason: frame.reason.to_string(),
                            },
                            None => CloseInfo::normal(),
                        };
                        let _ = in_tx.send(Frame::Closed(info));
                        return;
                    }
                    Ok(_) => {} // ping/pong/binary are not part of the envelope protocol
                    Err(e) => {
                        let _ = in_tx.send(Frame::Closed(CloseInfo::abnormal(e.to_string())));
                        return;
                    }
                }
            }
            let _ = in_tx.send(Frame::Closed(CloseInfo::abnormal("stream ended")));
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

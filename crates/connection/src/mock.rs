//! In-memory reference peer.
//!
//! Speaks the same envelope protocol as the API server's `/ws` endpoint:
//! every `subscribe` is acknowledged with `subscription_success` after
//! `ack_delay`. Tests drive it to refuse connections, inject server messages
//! and drop the link without a close handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use beacon_common::error::TransportError;
use beacon_common::types::Envelope;

use crate::connector::{CloseInfo, Connector, Frame, Link};

/// Default delay before a `subscribe` is acknowledged.
pub const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct PeerState {
    reachable: bool,
    open_delay: Duration,
    ack_delay: Duration,
    open_attempts: usize,
    opened: usize,
    sent: Vec<String>,
    client: Option<mpsc::UnboundedSender<Frame>>,
}

/// Connector backed by an in-process peer.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<PeerState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PeerState {
                reachable: true,
                open_delay: Duration::ZERO,
                ack_delay: DEFAULT_ACK_DELAY,
                open_attempts: 0,
                opened: 0,
                sent: Vec::new(),
                client: None,
            })),
        }
    }

    /// Delay between `open` being called and the link becoming ready.
    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.state.lock().open_delay = delay;
        self
    }

    pub fn with_ack_delay(self, delay: Duration) -> Self {
        self.state.lock().ack_delay = delay;
        self
    }

    /// While unreachable, every `open` fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Drop the current link without a close handshake (code 1006).
    /// Returns false when no link is open.
    pub fn drop_connection(&self) -> bool {
        self.end_link(CloseInfo::abnormal("connection reset by peer"))
    }

    /// Close the current link cleanly from the server side (code 1000).
    pub fn close_normally(&self) -> bool {
        self.end_link(CloseInfo::normal())
    }

    /// Deliver a server message on the current link.
    pub fn push(&self, envelope: &Envelope) -> bool {
        let Ok(text) = envelope.to_json() else {
            return false;
        };
        self.push_raw(text)
    }

    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        let state = self.state.lock();
        match &state.client {
            Some(client) => client.send(Frame::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Every `open` call, successful or not.
    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Successfully opened links.
    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    /// Raw text the client has sent, across all links.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    fn end_link(&self, info: CloseInfo) -> bool {
        let client = self.state.lock().client.take();
        match client {
            Some(client) => client.send(Frame::Closed(info)).is_ok(),
            None => false,
        }
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, endpoint: &str) -> Result<Link, TransportError> {
        let open_delay = {
            let mut state = self.state.lock();
            state.open_attempts += 1;
            state.open_delay
        };

        if !open_delay.is_zero() {
            tokio::time::sleep(open_delay).await;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        let ack_delay = {
            let mut state = self.state.lock();
            if !state.reachable {
                return Err(TransportError::Connect(format!(
                    "{} is unreachable",
                    endpoint
                )));
            }
            state.opened += 1;
            state.client = Some(in_tx.clone());
            state.ack_delay
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                state.lock().sent.push(text.clone());

                if let Ok(Envelope::Subscribe { channel }) = Envelope::from_json(&text) {
                    let ack_tx = in_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(ack_delay).await;
                        let ack = Envelope::SubscriptionSuccess {
                            channel: Some(channel),
                            data: Some(serde_json::json!({ "status": "subscribed" })),
                        };
                        if let Ok(json) = ack.to_json() {
                            let _ = ack_tx.send(Frame::Text(json));
                        }
                    });
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

//! `GET /ws?token=<jwt>`: live delivery over the envelope protocol.
//!
//! A client sends `subscribe` for `user:{its id}`; the server acknowledges
//! with `subscription_success` after [`ACK_DELAY`] and from then on forwards
//! every notification published to that channel.

use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{StreamExt, StreamMap};

use beacon_common::error::AppError;
use beacon_common::types::{Envelope, Notification, channel_user};

use crate::middleware::auth::authenticate_token;
use crate::state::AppState;

/// Delay before a `subscribe` is acknowledged.
pub const ACK_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let token = params
        .token
        .ok_or_else(|| AppError::Auth("Missing token query parameter".to_string()))?;
    let user = authenticate_token(&token, &state.config)?;

    tracing::info!(user_id = %user.user_id, "WebSocket client connected");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user.user_id)))
}

type Subscriptions = StreamMap<String, BroadcastStream<Notification>>;

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: String) {
    let mut subscriptions: Subscriptions = StreamMap::new();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            Some((channel, item)) = subscriptions.next(), if !subscriptions.is_empty() => {
                match item {
                    Ok(notification) => {
                        let envelope = Envelope::Notification {
                            channel: Some(channel),
                            notification,
                        };
                        if !send_envelope(&mut socket, &envelope).await {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(user_id = %user_id, skipped, "WebSocket client lagging");
                    }
                }
            }

            Some(ack) = ack_rx.recv() => {
                if socket.send(Message::Text(ack.into())).await.is_err() {
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let keep_open = handle_client_text(
                            text.as_str(),
                            &user_id,
                            &state,
                            &mut subscriptions,
                            &ack_tx,
                            &mut socket,
                        )
                        .await;
                        if !keep_open {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary carry no envelope
                    Some(Err(e)) => {
                        tracing::debug!(user_id = %user_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(user_id = %user_id, "WebSocket client disconnected");
}

/// Returns false if the socket should be closed.
async fn handle_client_text(
    text: &str,
    user_id: &str,
    state: &AppState,
    subscriptions: &mut Subscriptions,
    ack_tx: &mpsc::UnboundedSender<String>,
    socket: &mut WebSocket,
) -> bool {
    let channel = match Envelope::from_json(text) {
        Ok(Envelope::Subscribe { channel }) => channel,
        Ok(other) => {
            tracing::debug!(user_id, envelope = ?other, "Ignoring server-bound envelope");
            return true;
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Malformed client envelope");
            return true;
        }
    };

    if channel_user(&channel) != Some(user_id) {
        tracing::warn!(user_id, channel = %channel, "Subscribe to foreign channel rejected");
        let error = json!({
            "type": "error",
            "message": format!("Not allowed to subscribe to {}", channel),
        });
        return socket.send(Message::Text(error.to_string().into())).await.is_ok();
    }

    if !subscriptions.contains_key(&channel) {
        let receiver = state.channels.subscribe(&channel);
        subscriptions.insert(channel.clone(), BroadcastStream::new(receiver));
        tracing::info!(user_id, channel = %channel, "Subscribed");
    }

    let ack = Envelope::SubscriptionSuccess {
        channel: Some(channel),
        data: Some(json!({ "status": "subscribed" })),
    };
    match ack.to_json() {
        Ok(json) => {
            let ack_tx = ack_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ACK_DELAY).await;
                let _ = ack_tx.send(json);
            });
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode subscription ack"),
    }
    true
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> bool {
    match envelope.to_json() {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode envelope");
            true
        }
    }
}

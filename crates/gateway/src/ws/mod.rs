//! WebSocket endpoint: JSON text frames over `GET /api/v1/ws`.
//!
//! Client protocol:
//! - `{"action":"subscribe","channel":C}` → `{"type":"subscription.confirmed","channel":C}`
//! - `{"action":"catchup","channel":C,"last_event_id":N}` → up to 100
//!   replayed event frames, each carrying its `id`
//! - `{"action":"unsubscribe","channel":C}` → `{"type":"subscription.cancelled","channel":C}`
//! - `{"action":"ping"}` → `{"type":"pong"}`

pub mod hub;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::state::AppState;

/// Hard cap on catch-up replay per request.
const CATCHUP_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Catchup {
        channel: String,
        #[serde(default)]
        last_event_id: i64,
    },
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (connection_id, mut outbound) = state.hub.register();

    // Writer task: hub broadcasts and replies flow out through one sink.
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let reply = |value: serde_json::Value| {
        state.hub.send_to(&connection_id, value.to_string());
    };

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { channel }) => {
                    if state.hub.subscribe(&connection_id, &channel).await {
                        reply(serde_json::json!({
                            "type": "subscription.confirmed",
                            "channel": channel,
                        }));
                    }
                }
                Ok(ClientFrame::Unsubscribe { channel }) => {
                    state.hub.unsubscribe(&connection_id, &channel);
                    reply(serde_json::json!({
                        "type": "subscription.cancelled",
                        "channel": channel,
                    }));
                }
                Ok(ClientFrame::Catchup {
                    channel,
                    last_event_id,
                }) => {
                    let frames = state
                        .hub
                        .catchup(&channel, last_event_id, CATCHUP_LIMIT)
                        .await;
                    for frame in frames {
                        reply(frame);
                    }
                }
                Ok(ClientFrame::Ping) => {
                    reply(serde_json::json!({"type": "pong"}));
                }
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "unparseable frame");
                    reply(serde_json::json!({
                        "type": "error",
                        "message": format!("unrecognized frame: {e}"),
                    }));
                }
            },
            Message::Close(_) => break,
            // axum answers protocol-level pings itself.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                tracing::debug!(connection_id = %connection_id, "ignoring binary frame");
            }
        }
    }

    // Unregister channel callbacks before dropping the connection; this
    // ordering prevents a forwarder from writing into a dead socket slot.
    state.hub.disconnect(&connection_id);
    writer.abort();
}

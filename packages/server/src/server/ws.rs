//! WebSocket fanout of lifecycle events.
//!
//! Handshake at `/ws`: the server assigns a client id, acknowledges with a
//! `connected` frame, and then relays every bus event matching the
//! client's subscriptions as `{type: <channel>, ...payload}`. A slow
//! client only loses its own frames; the bus never blocks on it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::IntoResponse;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::time::now_millis;
use crate::kernel::bus::EventFrame;
use crate::server::app::AppState;

/// `GET /ws/status`: WebSocket server health. Lives under the `/ws`
/// prefix so no parametric scan route can ever shadow it.
pub async fn ws_status_handler(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "clients": state.bus.client_count().await,
        "timestamp": now_millis(),
    }))
}

/// `GET /ws`: upgrade and run the fanout loop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct WsIncoming {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    #[serde(default)]
    channels: Vec<String>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let mut mailbox = state.bus.register(client_id).await;
    info!(%client_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();

    if send_json(
        &mut sender,
        json!({
            "type": "connected",
            "client_id": client_id,
            "timestamp": now_millis(),
        }),
    )
    .await
    .is_err()
    {
        state.bus.disconnect(client_id).await;
        return;
    }

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_message(&state, client_id, &mut sender, &text).await {
                            let _ = send_json(
                                &mut sender,
                                json!({"type": "error", "message": e, "timestamp": now_millis()}),
                            )
                            .await;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%client_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            frame = mailbox.recv() => {
                match frame {
                    Ok(frame) => {
                        if send_json(&mut sender, relay_payload(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // This client fell behind; its oldest frames are gone.
                        warn!(%client_id, skipped, "websocket client lagged, frames dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.bus.disconnect(client_id).await;
    info!(%client_id, "websocket client disconnected");
}

async fn handle_message(
    state: &AppState,
    client_id: Uuid,
    sender: &mut (impl SinkExt<Message> + Unpin),
    text: &str,
) -> Result<(), String> {
    let incoming: WsIncoming =
        serde_json::from_str(text).map_err(|e| format!("invalid message: {e}"))?;

    match incoming.msg_type.as_deref() {
        Some("subscribe") => {
            state.bus.subscribe(client_id, &incoming.channels).await;
            send_json(
                sender,
                json!({
                    "type": "subscribed",
                    "channels": incoming.channels,
                    "timestamp": now_millis(),
                }),
            )
            .await
            .map_err(|_| "send failed".to_string())
        }
        Some("unsubscribe") => {
            let patterns = if incoming.channels.is_empty() {
                None
            } else {
                Some(incoming.channels.as_slice())
            };
            state.bus.unsubscribe(client_id, patterns).await;
            send_json(
                sender,
                json!({
                    "type": "unsubscribed",
                    "channels": incoming.channels,
                    "timestamp": now_millis(),
                }),
            )
            .await
            .map_err(|_| "send failed".to_string())
        }
        Some("ping") => send_json(
            sender,
            json!({"type": "pong", "timestamp": now_millis()}),
        )
        .await
        .map_err(|_| "send failed".to_string()),
        Some(other) => Err(format!("unknown message type: {other}")),
        None => Err("missing message type".to_string()),
    }
}

/// Frames go out as the payload object with the channel folded into `type`.
fn relay_payload(frame: EventFrame) -> Value {
    match frame.payload {
        Value::Object(mut map) => {
            map.insert("type".to_string(), Value::String(frame.channel));
            Value::Object(map)
        }
        other => json!({"type": frame.channel, "payload": other}),
    }
}

async fn send_json(sender: &mut (impl SinkExt<Message> + Unpin), payload: Value) -> Result<(), ()> {
    let text = serde_json::to_string(&payload).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

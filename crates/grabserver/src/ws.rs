//! WebSocket transport for progress channels.
//!
//! Client frames: `{"event":"subscribe","data":{"progress_id":"..."}}`.
//! Server frames: `subscribed` acknowledgements and `progress` events.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    api::AppState,
    progress::{ProgressEvent, ProgressHub, Subscriber},
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: SubscribeData,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeData {
    progress_id: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
enum ServerFrame {
    Subscribed(SubscribeAck),
    Progress(ProgressEvent),
}

#[derive(Debug, Serialize, PartialEq)]
struct SubscribeAck {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn progress_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: ProgressHub) {
    let (mut sender, mut receiver) = socket.split();
    // Dropped when this function returns, which ends every membership.
    let mut subscriber = hub.connect();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        let outgoing = tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match handle_client_frame(&mut subscriber, text.as_str()) {
                        Some(ack) => ack,
                        None => continue,
                    }
                }
                Some(Ok(Message::Ping(data))) => Message::Pong(data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("websocket error: {e}");
                    break;
                }
                Some(Ok(_)) => continue,
            },
            event = subscriber.recv() => match event {
                Some(event) => match encode(&ServerFrame::Progress(event)) {
                    Some(msg) => msg,
                    None => continue,
                },
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Bytes::new()),
        };

        if sender.send(outgoing).await.is_err() {
            tracing::debug!("websocket client went away");
            break;
        }
    }
}

fn handle_client_frame(subscriber: &mut Subscriber, text: &str) -> Option<Message> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("ignoring malformed client frame: {e}");
            return None;
        }
    };
    if frame.event != "subscribe" {
        return None;
    }

    encode(&ServerFrame::Subscribed(subscribe(subscriber, frame.data)))
}

fn subscribe(subscriber: &mut Subscriber, data: SubscribeData) -> SubscribeAck {
    let progress_id = data.progress_id.unwrap_or_default();
    match subscriber.subscribe(&progress_id) {
        Ok(()) => SubscribeAck {
            ok: true,
            progress_id: Some(progress_id.trim().to_string()),
            error: None,
        },
        Err(e) => SubscribeAck {
            ok: false,
            progress_id: None,
            error: Some(e.to_string()),
        },
    }
}

fn encode(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::warn!("failed to encode websocket frame: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_joins_channel() {
        let hub = ProgressHub::new();
        let mut subscriber = hub.connect();

        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"subscribe","data":{"progress_id":"abc"}}"#).unwrap();
        let ack = subscribe(&mut subscriber, frame.data);

        assert_eq!(
            ack,
            SubscribeAck {
                ok: true,
                progress_id: Some("abc".into()),
                error: None
            }
        );
        assert_eq!(hub.member_count("abc"), 1);
    }

    #[test]
    fn missing_progress_id_is_refused() {
        let hub = ProgressHub::new();
        let mut subscriber = hub.connect();

        let frame: ClientFrame = serde_json::from_str(r#"{"event":"subscribe"}"#).unwrap();
        let ack = subscribe(&mut subscriber, frame.data);

        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("missing progress_id"));
    }

    #[test]
    fn frames_serialize_with_event_envelope() {
        let json = serde_json::to_value(ServerFrame::Progress(ProgressEvent::Error {
            message: "boom".into(),
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "progress", "data": {"status": "error", "message": "boom"}})
        );

        let json = serde_json::to_value(ServerFrame::Subscribed(SubscribeAck {
            ok: true,
            progress_id: Some("r".into()),
            error: None,
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "subscribed", "data": {"ok": true, "progress_id": "r"}})
        );
    }

    #[test]
    fn unknown_or_malformed_frames_are_ignored() {
        let hub = ProgressHub::new();
        let mut subscriber = hub.connect();
        assert!(handle_client_frame(&mut subscriber, "not json").is_none());
        assert!(handle_client_frame(&mut subscriber, r#"{"event":"ping"}"#).is_none());
        assert!(handle_client_frame(
            &mut subscriber,
            r#"{"event":"subscribe","data":{"progress_id":"x"}}"#
        )
        .is_some());
    }
}

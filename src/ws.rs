use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

use crate::api::AppState;
use crate::models::TicketStatus;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Frame types ──────────────────────────────────────────────────────

/// Frames pushed to WebSocket clients. The literal client text `"ping"`
/// is answered with a `Pong` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    StatusUpdate {
        ticket_id: String,
        status: TicketStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        ticket_id: String,
        message: String,
    },
    Pong,
}

impl WsFrame {
    fn ticket_id(&self) -> Option<&str> {
        match self {
            Self::StatusUpdate { ticket_id, .. } | Self::Log { ticket_id, .. } => Some(ticket_id),
            Self::Pong => None,
        }
    }
}

/// Should a broadcast payload be forwarded on a socket subscribed to one
/// ticket? Unparseable payloads are dropped rather than leaked.
fn frame_matches(payload: &str, ticket_id: &str) -> bool {
    match serde_json::from_str::<WsFrame>(payload) {
        Ok(frame) => frame.ticket_id() == Some(ticket_id),
        Err(_) => false,
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /ws/tickets` — every frame for every ticket.
pub async fn ws_global_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, None))
}

/// `GET /ws/tickets/{ticket_id}` — frames for one ticket only.
pub async fn ws_ticket_handler(
    ws: WebSocketUpgrade,
    Path(ticket_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, Some(ticket_id)))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<String>,
    ticket_filter: Option<String>,
) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, ticket_filter).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message handling, and periodic
/// ping/pong health checking in one select loop. If no Pong arrives within
/// [`PONG_TIMEOUT`] after a Ping, the connection is considered dead.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    ticket_filter: Option<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(payload) => {
                        if let Some(ref id) = ticket_filter {
                            if !frame_matches(&payload, id) {
                                continue;
                            }
                        }
                        if sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some frames; keep receiving.
                        continue;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            if let Ok(pong) = serde_json::to_string(&WsFrame::Pong) {
                                if sender.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        // Other client text is ignored.
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore binary and protocol pings (answered by axum).
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a frame to all connected WebSocket clients.
/// Returns silently if no clients are connected.
pub fn broadcast_frame(tx: &broadcast::Sender<String>, frame: &WsFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            warn!("Failed to serialize WsFrame: {}", e);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_wire_format() {
        let frame = WsFrame::StatusUpdate {
            ticket_id: "t-1".to_string(),
            status: TicketStatus::InProgress,
            step: Some("queued".to_string()),
            progress: Some(10),
            message: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["step"], "queued");
        assert_eq!(json["progress"], 10);
        // Absent optionals are omitted, not null.
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_log_wire_format() {
        let frame = WsFrame::Log {
            ticket_id: "t-1".to_string(),
            message: "agent failed: timeout".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"log\""));
        assert!(json.contains("\"ticket_id\":\"t-1\""));
    }

    #[test]
    fn test_pong_wire_format() {
        assert_eq!(
            serde_json::to_string(&WsFrame::Pong).unwrap(),
            "{\"type\":\"pong\"}"
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = WsFrame::StatusUpdate {
            ticket_id: "t-9".to_string(),
            status: TicketStatus::Review,
            step: None,
            progress: None,
            message: Some("done".to_string()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: WsFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_frame_matches_filters_by_ticket() {
        let frame = WsFrame::Log {
            ticket_id: "t-1".to_string(),
            message: "hello".to_string(),
        };
        let payload = serde_json::to_string(&frame).unwrap();
        assert!(frame_matches(&payload, "t-1"));
        assert!(!frame_matches(&payload, "t-2"));
        assert!(!frame_matches("not json", "t-1"));
        // Pong frames carry no ticket and never match a filtered socket.
        assert!(!frame_matches("{\"type\":\"pong\"}", "t-1"));
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let (tx, _) = broadcast::channel::<String>(16);
        let mut rx1 = tx.subscribe();
        let mut rx2 = tx.subscribe();

        broadcast_frame(
            &tx,
            &WsFrame::Log {
                ticket_id: "t-1".to_string(),
                message: "m".to_string(),
            },
        );

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert!(received1.contains("\"type\":\"log\""));
        assert_eq!(received1, received2);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_does_not_panic() {
        let (tx, _) = broadcast::channel::<String>(16);
        broadcast_frame(
            &tx,
            &WsFrame::Log {
                ticket_id: "t".to_string(),
                message: "m".to_string(),
            },
        );
    }

    #[test]
    fn test_keepalive_constants() {
        // PONG_TIMEOUT must exceed PING_INTERVAL so a fresh connection is
        // not immediately considered dead.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}

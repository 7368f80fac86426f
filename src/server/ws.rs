use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use crate::store::ChangeEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Change(ChangeEvent),
    /// The server dropped `missed` events for this client; reload.
    Lagged { missed: u64 },
}

/// Optional `?table=` restriction for one socket.
#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub table: Option<String>,
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<FeedQuery>,
) -> impl IntoResponse {
    let rx = state.changes.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, query.table))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<ChangeEvent>,
    table: Option<String>,
) {
    tracing::debug!(table = ?table, "change feed client connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, table).await;
    tracing::debug!("change feed client disconnected");
}

/// Encode what the client should see for one broadcast result, if anything.
pub fn frame_for(
    result: Result<ChangeEvent, broadcast::error::RecvError>,
    table: Option<&str>,
) -> Option<WsMessage> {
    match result {
        Ok(event) if table.is_none_or(|t| t == event.table) => Some(WsMessage::Change(event)),
        Ok(_) => None,
        Err(broadcast::error::RecvError::Lagged(missed)) => Some(WsMessage::Lagged { missed }),
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards change events, answers client frames, and pings every
/// [`PING_INTERVAL`]. A client that has not answered within
/// [`PONG_TIMEOUT`] is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<ChangeEvent>,
    table: Option<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("change feed client missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                if matches!(result, Err(broadcast::error::RecvError::Closed)) {
                    break;
                }
                let Some(frame) = frame_for(result, table.as_deref()) else {
                    continue;
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode change frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeKind, Row};

    fn event(table: &str) -> ChangeEvent {
        let mut row = Row::new();
        row.insert("id".into(), "r1".into());
        ChangeEvent {
            table: table.into(),
            kind: ChangeKind::Insert,
            row,
        }
    }

    #[test]
    fn test_change_frame_serialization() {
        let json = serde_json::to_string(&WsMessage::Change(event("cards"))).unwrap();
        assert!(json.contains("\"type\":\"change\""));
        assert!(json.contains("\"table\":\"cards\""));
        assert!(json.contains("\"kind\":\"insert\""));
    }

    #[test]
    fn test_lagged_frame_serialization() {
        let json = serde_json::to_string(&WsMessage::Lagged { missed: 7 }).unwrap();
        assert!(json.contains("\"type\":\"lagged\""));
        assert!(json.contains("\"missed\":7"));
    }

    #[test]
    fn test_frame_for_filters_by_table() {
        assert!(frame_for(Ok(event("cards")), Some("cards")).is_some());
        assert!(frame_for(Ok(event("cards")), Some("notifications")).is_none());
        assert!(frame_for(Ok(event("cards")), None).is_some());
    }

    #[test]
    fn test_frame_for_reports_lag() {
        let frame = frame_for(Err(broadcast::error::RecvError::Lagged(3)), Some("cards"));
        assert!(matches!(frame, Some(WsMessage::Lagged { missed: 3 })));
        assert!(frame_for(Err(broadcast::error::RecvError::Closed), None).is_none());
    }
}

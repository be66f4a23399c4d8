use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Broadcast capacity per trip channel. Receivers that fall further behind
/// than this skip missed frames and continue (best effort by design).
const CHANNEL_CAPACITY: usize = 64;

// ── Frame types ──────────────────────────────────────────────────────

/// Frames a client may send. Drivers publish `location`; dashboards and
/// passenger apps send `join` / `leave`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        trip_id: i64,
    },
    Leave,
    Location {
        trip_id: i64,
        latitude: f64,
        longitude: f64,
        speed_kmh: Option<f64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined {
        trip_id: i64,
    },
    Location {
        trip_id: i64,
        latitude: f64,
        longitude: f64,
        speed_kmh: Option<f64>,
        recorded_at: String,
    },
    Error {
        message: String,
    },
}

// ── Per-trip channel registry ────────────────────────────────────────

type Relayed = (Uuid, String);

/// Registry of broadcast channels keyed by trip id.
///
/// A frame published to one trip's channel reaches every subscriber of that
/// trip and nobody else. The origin id lets the relay loop drop the
/// publisher's own echo. Channels carry no buffering or ordering guarantees
/// beyond arrival order; message volume and listener counts are small.
#[derive(Default)]
pub struct TripChannels {
    inner: Mutex<HashMap<i64, broadcast::Sender<Relayed>>>,
}

impl TripChannels {
    fn sender(&self, trip_id: i64) -> broadcast::Sender<Relayed> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(trip_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a trip's channel, creating it on first use.
    pub fn join(&self, trip_id: i64) -> broadcast::Receiver<Relayed> {
        self.sender(trip_id).subscribe()
    }

    /// Serialize and publish a frame to a trip's channel. Returns the number
    /// of listeners it reached; zero listeners is not an error. A channel
    /// whose last listener is gone is dropped from the registry here so the
    /// map does not grow with every trip ever joined.
    pub fn publish(&self, trip_id: i64, origin: Uuid, frame: &ServerFrame) -> usize {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize relay frame: {}", e);
                return 0;
            }
        };
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.entry(trip_id) {
            Entry::Occupied(entry) => {
                let reached = entry.get().send((origin, json)).unwrap_or(0);
                if reached == 0 && entry.get().receiver_count() == 0 {
                    entry.remove();
                }
                reached
            }
            Entry::Vacant(_) => 0,
        }
    }

    /// Drop a trip's channel entry if it has no listeners left. Called when
    /// a connection leaves a trip or its socket loop exits.
    pub fn prune(&self, trip_id: i64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(&trip_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            map.remove(&trip_id);
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, state).await;
}

async fn next_relayed(
    joined: &mut Option<(i64, broadcast::Receiver<Relayed>)>,
) -> Result<Relayed, broadcast::error::RecvError> {
    match joined {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Drop the connection's subscription and discard the channel if it was the
/// last listener.
fn leave_channel(state: &SharedState, joined: &mut Option<(i64, broadcast::Receiver<Relayed>)>) {
    if let Some((trip_id, rx)) = joined.take() {
        drop(rx);
        state.channels.prune(trip_id);
    }
}

/// Core relay loop with ping/pong keepalive.
///
/// A connection listens to at most one trip channel; joining another trip
/// switches the subscription. Location frames from the client are stamped
/// with a server-side timestamp and rebroadcast to the trip's other
/// listeners. If no Pong is received within [`PONG_TIMEOUT`] after a Ping,
/// the connection is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    state: SharedState,
) {
    let conn_id = Uuid::new_v4();
    let mut joined: Option<(i64, broadcast::Receiver<Relayed>)> = None;

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
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Relay forwarding ────────────────────────────────────
            result = next_relayed(&mut joined) => {
                match result {
                    Ok((origin, json)) => {
                        if origin == conn_id {
                            continue;
                        }
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        leave_channel(&state, &mut joined);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some frames; continue receiving
                        continue;
                    }
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_frame(
                            &state, conn_id, &mut joined, text.as_str(),
                        );
                        if let Some(reply) = reply {
                            let json = match serde_json::to_string(&reply) {
                                Ok(json) => json,
                                Err(_) => continue,
                            };
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore Binary and Ping frames from clients
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    leave_channel(&state, &mut joined);

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Apply one client frame, returning the direct reply to send back (if any).
fn handle_client_frame(
    state: &SharedState,
    conn_id: Uuid,
    joined: &mut Option<(i64, broadcast::Receiver<Relayed>)>,
    text: &str,
) -> Option<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(ServerFrame::Error {
                message: format!("Unrecognized frame: {}", e),
            });
        }
    };

    match frame {
        ClientFrame::Join { trip_id } => {
            leave_channel(state, joined);
            *joined = Some((trip_id, state.channels.join(trip_id)));
            Some(ServerFrame::Joined { trip_id })
        }
        ClientFrame::Leave => {
            leave_channel(state, joined);
            None
        }
        ClientFrame::Location {
            trip_id,
            latitude,
            longitude,
            speed_kmh,
        } => {
            let out = ServerFrame::Location {
                trip_id,
                latitude,
                longitude,
                speed_kmh,
                recorded_at: Utc::now().to_rfc3339(),
            };
            state.channels.publish(trip_id, conn_id, &out);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location_frame(trip_id: i64) -> ServerFrame {
        ServerFrame::Location {
            trip_id,
            latitude: 12.97,
            longitude: 77.59,
            speed_kmh: Some(24.0),
            recorded_at: "2026-08-28T10:00:00Z".to_string(),
        }
    }

    #[test]
    fn client_frame_join_deserializes() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"join","trip_id":5}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Join { trip_id: 5 }));
    }

    #[test]
    fn client_frame_location_deserializes_without_speed() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"location","trip_id":5,"latitude":12.9,"longitude":77.5}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Location { speed_kmh, .. } => assert!(speed_kmh.is_none()),
            _ => panic!("Expected Location frame"),
        }
    }

    #[test]
    fn server_frame_location_serializes_tagged() {
        let json = serde_json::to_string(&location_frame(5)).unwrap();
        assert!(json.contains("\"type\":\"location\""));
        assert!(json.contains("\"trip_id\":5"));
        assert!(json.contains("\"recorded_at\""));
    }

    #[tokio::test]
    async fn publish_reaches_all_listeners_of_the_same_trip() {
        let channels = TripChannels::default();
        let mut rx1 = channels.join(1);
        let mut rx2 = channels.join(1);

        let reached = channels.publish(1, Uuid::new_v4(), &location_frame(1));
        assert_eq!(reached, 2);

        let (_, json1) = rx1.recv().await.unwrap();
        let (_, json2) = rx2.recv().await.unwrap();
        assert_eq!(json1, json2);
        assert!(json1.contains("\"type\":\"location\""));
    }

    #[tokio::test]
    async fn publish_does_not_cross_trip_channels() {
        let channels = TripChannels::default();
        let _rx_trip1 = channels.join(1);
        let mut rx_trip2 = channels.join(2);

        channels.publish(1, Uuid::new_v4(), &location_frame(1));
        assert!(matches!(
            rx_trip2.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn publish_with_no_listeners_does_not_panic() {
        let channels = TripChannels::default();
        let reached = channels.publish(99, Uuid::new_v4(), &location_frame(99));
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn origin_tag_travels_with_the_frame() {
        let channels = TripChannels::default();
        let mut rx = channels.join(3);
        let origin = Uuid::new_v4();

        channels.publish(3, origin, &location_frame(3));
        let (tag, _) = rx.recv().await.unwrap();
        assert_eq!(tag, origin);
    }

    fn channel_count(channels: &TripChannels) -> usize {
        channels.inner.lock().unwrap().len()
    }

    #[test]
    fn publish_to_abandoned_trip_drops_the_channel() {
        let channels = TripChannels::default();
        let rx = channels.join(1);
        assert_eq!(channel_count(&channels), 1);

        drop(rx);
        let reached = channels.publish(1, Uuid::new_v4(), &location_frame(1));
        assert_eq!(reached, 0);
        assert_eq!(channel_count(&channels), 0);
    }

    #[test]
    fn prune_removes_only_listenerless_channels() {
        let channels = TripChannels::default();
        let _live = channels.join(1);
        let dead = channels.join(2);
        drop(dead);

        channels.prune(1);
        channels.prune(2);
        assert_eq!(channel_count(&channels), 1);

        // A live channel survives and still delivers.
        let reached = channels.publish(1, Uuid::new_v4(), &location_frame(1));
        assert_eq!(reached, 1);
    }

    #[test]
    fn publish_without_prior_join_does_not_create_a_channel() {
        let channels = TripChannels::default();
        channels.publish(42, Uuid::new_v4(), &location_frame(42));
        assert_eq!(channel_count(&channels), 0);
    }

    #[test]
    fn keepalive_constants() {
        // PONG_TIMEOUT must exceed PING_INTERVAL so a fresh connection is
        // not immediately considered dead.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}

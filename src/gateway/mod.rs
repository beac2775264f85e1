//! WebSocket gateway: one persistent connection per client, carrying an
//! unbounded sequence of subscribe/unsubscribe/vote messages, with room
//! events flowing back over a bounded per-connection queue.

pub mod messages;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::VoteError;
use crate::rooms::{ConnectionId, RoomEvent};
use messages::{ClientMessage, ErrorCode, ServerMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct GatewayState {
    engine: Arc<Engine>,
    outbound_queue_capacity: usize,
}

pub fn router(engine: Arc<Engine>, outbound_queue_capacity: usize) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(GatewayState {
            engine,
            outbound_queue_capacity,
        })
}

#[derive(Deserialize)]
struct ConnectParams {
    voter: Option<String>,
}

/// Connection-side delivery gate for queued room events. Every snapshot sent
/// to the client records a per-poll revision floor; a queued event at or
/// below the floor predates the snapshot and is dropped rather than
/// forwarded, so the client never sees a count regress behind a snapshot it
/// already holds. Events for polls the connection has left are dropped the
/// same way.
#[derive(Default)]
struct DeliveryFilter {
    subscribed: HashSet<String>,
    floors: HashMap<String, u64>,
}

impl DeliveryFilter {
    /// Records a snapshot sent at `revision`, which becomes the poll's new
    /// floor. Used on subscribe and on every resync.
    fn note_snapshot(&mut self, poll_id: &str, revision: u64) {
        self.subscribed.insert(poll_id.to_string());
        self.floors.insert(poll_id.to_string(), revision);
    }

    fn unsubscribe(&mut self, poll_id: &str) {
        self.subscribed.remove(poll_id);
        self.floors.remove(poll_id);
    }

    fn should_forward(&self, event: &RoomEvent) -> bool {
        let poll_id = event.poll_id();
        if !self.subscribed.contains(poll_id) {
            return false;
        }
        match self.floors.get(poll_id) {
            Some(&floor) => event.revision() > floor,
            None => true,
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    // The identity collaborator supplies an opaque voter id at connection
    // time; a connection without one gets an anonymous session id.
    let voter_id = params
        .voter
        .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()));
    ws.on_upgrade(move |socket| handle_socket(socket, state, voter_id))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(socket: WebSocket, state: GatewayState, voter_id: String) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let engine = state.engine;
    info!("connection {} established", conn_id);

    let (mut sink, mut stream) = socket.split();
    // Bounded outbound queue; overflow flags this connection stale (see the
    // rooms module) and `notify` wakes the resync branch below.
    let (tx, mut rx) = mpsc::channel::<RoomEvent>(state.outbound_queue_capacity);
    let notify = Arc::new(Notify::new());
    let mut filter = DeliveryFilter::default();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if handle_client_message(
                                    &engine, conn_id, &voter_id, msg, &tx, &notify,
                                    &mut filter, &mut sink,
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("connection {} sent malformed message: {}", conn_id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(_)) => break,
                }
            }
            Some(event) = rx.recv() => {
                if filter.should_forward(&event)
                    && send_message(&mut sink, &ServerMessage::from(event)).await.is_err()
                {
                    break;
                }
            }
            _ = notify.notified() => {
                if resynchronize(&engine, conn_id, &mut rx, &mut filter, &mut sink)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    engine.drop_connection(conn_id);
    info!("connection {} closed", conn_id);
}

async fn handle_client_message(
    engine: &Engine,
    conn_id: ConnectionId,
    voter_id: &str,
    msg: ClientMessage,
    tx: &mpsc::Sender<RoomEvent>,
    notify: &Arc<Notify>,
    filter: &mut DeliveryFilter,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    match msg {
        ClientMessage::Subscribe { poll_id } => {
            match engine
                .subscribe(conn_id, &poll_id, tx.clone(), notify.clone())
                .await
            {
                Ok(poll) => {
                    filter.note_snapshot(&poll_id, poll.revision);
                    send_message(sink, &ServerMessage::snapshot(poll)).await?;
                }
                Err(err) => send_rejection(sink, conn_id, err, Some(poll_id)).await?,
            }
        }
        ClientMessage::Unsubscribe { poll_id } => {
            engine.unsubscribe(conn_id, &poll_id);
            // Queued events for the left room are dropped at the forwarding
            // gate; the client stops hearing the room at this boundary.
            filter.unsubscribe(&poll_id);
        }
        ClientMessage::Vote { poll_id, option_id } => {
            match engine.submit_vote(&poll_id, voter_id, &option_id).await {
                // An accepted vote surfaces as a room delta, not an ack.
                Ok(receipt) => {
                    debug!(
                        "connection {} vote accepted on poll {} at revision {}",
                        conn_id, poll_id, receipt.revision
                    );
                }
                Err(err) => send_rejection(sink, conn_id, err, Some(poll_id)).await?,
            }
        }
    }
    Ok(())
}

async fn send_rejection(
    sink: &mut SplitSink<WebSocket, Message>,
    conn_id: ConnectionId,
    err: VoteError,
    poll_id: Option<String>,
) -> Result<(), axum::Error> {
    match ErrorCode::from_vote_error(&err) {
        Some(code) => send_message(sink, &ServerMessage::Error { code, poll_id }).await,
        None => {
            // Internal failures have no wire code; the client recovers by
            // reconnecting for a fresh snapshot.
            error!("connection {}: {}", conn_id, err);
            Ok(())
        }
    }
}

/// The Dispatcher flagged this connection stale on one or more polls: drop
/// the queued backlog for those polls and restart each of them from a fresh
/// snapshot. Events for unaffected polls are forwarded untouched. A delta
/// that slips into the queue while this runs carries a revision at or below
/// the snapshot about to be read (publishes and snapshot reads serialize on
/// the poll lock), so the snapshot's revision floor in the filter stops it
/// from being forwarded later.
async fn resynchronize(
    engine: &Engine,
    conn_id: ConnectionId,
    rx: &mut mpsc::Receiver<RoomEvent>,
    filter: &mut DeliveryFilter,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let stale = engine.rooms().take_stale(conn_id);
    if stale.is_empty() {
        return Ok(());
    }
    info!(
        "connection {} resynchronizing {} poll(s)",
        conn_id,
        stale.len()
    );

    while let Ok(event) = rx.try_recv() {
        if stale.iter().any(|poll_id| poll_id == event.poll_id()) {
            continue; // superseded by the snapshot below
        }
        if !filter.should_forward(&event) {
            continue;
        }
        send_message(sink, &ServerMessage::from(event)).await?;
    }

    for poll_id in stale {
        match engine.snapshot(&poll_id).await {
            Ok(poll) => {
                filter.note_snapshot(&poll_id, poll.revision);
                send_message(sink, &ServerMessage::snapshot(poll)).await?;
            }
            Err(e) => warn!(
                "connection {} failed to resync poll {}: {}",
                conn_id, poll_id, e
            ),
        }
    }
    Ok(())
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            error!("failed to encode server message: {}", e);
            Ok(())
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::keying::KeyingTracker;
use crate::polling::PollingService;
use crate::state::{StateManager, TxEvent};

use super::messages::{envelope, MessageType};

const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// `(request) -> (allowed, is_admin)`. Consults the `token` query parameter
/// when present; an empty token falls back to the anonymous-allowed flag
/// (spec.md §4.6).
pub type Validator = Arc<dyn Fn(Option<&str>) -> (bool, bool) + Send + Sync>;

pub fn default_validator(allow_anon_dashboard: bool) -> Validator {
    Arc::new(move |token| match token {
        Some(raw) if !raw.is_empty() => (true, raw.eq_ignore_ascii_case("admin")),
        _ => (allow_anon_dashboard, false),
    })
}

struct ClientHandle {
    tx: mpsc::Sender<String>,
    is_admin: bool,
}

/// Client registry and diff fan-out for live dashboards (spec.md §4.6).
pub struct Hub {
    clients: Mutex<HashMap<Uuid, ClientHandle>>,
    validator: Validator,
    state: Arc<StateManager>,
    keying: Arc<KeyingTracker>,
    polling: Arc<PollingService>,
    heartbeat_interval: Duration,
    tx_batch_window: Duration,
}

impl Hub {
    pub fn new(
        state: Arc<StateManager>,
        keying: Arc<KeyingTracker>,
        polling: Arc<PollingService>,
        validator: Validator,
        heartbeat_interval: Duration,
        tx_batch_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Hub {
            clients: Mutex::new(HashMap::new()),
            validator,
            state,
            keying,
            polling,
            heartbeat_interval,
            tx_batch_window,
        })
    }

    /// Spawns the background fan-out loops: snapshot/diff/talker/keying
    /// forwarding, the TX batcher, and the heartbeat ticker.
    pub fn start(self: &Arc<Self>, cancel: watch::Receiver<bool>) {
        tokio::spawn(forward_snapshots(self.clone(), cancel.clone()));
        tokio::spawn(forward_link_diffs(self.clone(), cancel.clone()));
        tokio::spawn(forward_talker(self.clone(), cancel.clone()));
        tokio::spawn(forward_keying(self.clone(), cancel.clone()));
        tokio::spawn(batch_tx_events(self.clone(), cancel.clone()));
        tokio::spawn(heartbeat_loop(self.clone(), cancel));
    }

    fn broadcast(&self, payload: String) {
        let clients = self.clients.lock().expect("ws client table poisoned");
        for handle in clients.values() {
            let _ = handle.tx.try_send(payload.clone());
        }
    }

    fn register(&self, id: Uuid, tx: mpsc::Sender<String>, is_admin: bool) {
        self.clients
            .lock()
            .expect("ws client table poisoned")
            .insert(id, ClientHandle { tx, is_admin });
    }

    fn deregister(&self, id: &Uuid) {
        self.clients.lock().expect("ws client table poisoned").remove(id);
    }

    fn client_count(&self) -> usize {
        self.clients.lock().expect("ws client table poisoned").len()
    }
}

pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    let token = params.get("token").map(String::as_str);
    let (allowed, is_admin) = (hub.validator)(token);
    if !allowed {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(hub, socket, is_admin))
}

#[instrument(skip(hub, socket))]
async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, is_admin: bool) {
    let client_id = Uuid::new_v4();
    let (socket_tx, socket_rx) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(CLIENT_CHANNEL_CAPACITY);

    hub.register(client_id, tx.clone(), is_admin);
    info!(%client_id, is_admin, clients = hub.client_count(), "websocket client connected");

    let _ = tx.try_send(envelope(MessageType::Session, serde_json::json!({ "isAdmin": is_admin })));
    for snapshot in hub.state.snapshots() {
        let _ = tx.try_send(envelope(MessageType::StatusUpdate, snapshot));
    }
    let _ = tx.try_send(envelope(MessageType::TalkerEvent, hub.state.talker_snapshot()));
    hub.polling.trigger_poll_once().await;

    let mut downstream = tokio::spawn(run_downstream(socket_tx, rx));
    let mut upstream = tokio::spawn(run_upstream(socket_rx));

    tokio::select! {
        _ = &mut downstream => { upstream.abort(); }
        _ = &mut upstream => { downstream.abort(); }
    }

    hub.deregister(&client_id);
    info!(%client_id, "websocket client disconnected");
}

async fn run_downstream(
    mut sender: futures::stream::SplitSink<WebSocket, WsFrame>,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(payload) = rx.recv().await {
        if sender.send(WsFrame::Text(payload)).await.is_err() {
            break;
        }
    }
}

async fn run_upstream(mut receiver: futures::stream::SplitStream<WebSocket>) {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(WsFrame::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

async fn forward_snapshots(hub: Arc<Hub>, mut cancel: watch::Receiver<bool>) {
    let mut stream = BroadcastStream::new(hub.state.subscribe_snapshots());
    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok(snapshot)) => hub.broadcast(envelope(MessageType::StatusUpdate, snapshot)),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            _ = cancel.changed() => { if *cancel.borrow() { return; } }
        }
    }
}

async fn forward_link_diffs(hub: Arc<Hub>, mut cancel: watch::Receiver<bool>) {
    let mut added = BroadcastStream::new(hub.state.subscribe_link_added());
    let mut removed = BroadcastStream::new(hub.state.subscribe_link_removed());
    loop {
        tokio::select! {
            item = added.next() => {
                match item {
                    Some(Ok(links)) => hub.broadcast(envelope(MessageType::LinkAdded, links)),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            item = removed.next() => {
                match item {
                    Some(Ok(ids)) => hub.broadcast(envelope(MessageType::LinkRemoved, ids)),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            _ = cancel.changed() => { if *cancel.borrow() { return; } }
        }
    }
}

async fn forward_talker(hub: Arc<Hub>, mut cancel: watch::Receiver<bool>) {
    let mut stream = BroadcastStream::new(hub.state.subscribe_talker());
    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok(event)) => hub.broadcast(envelope(MessageType::TalkerEvent, event)),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            _ = cancel.changed() => { if *cancel.borrow() { return; } }
        }
    }
}

async fn forward_keying(hub: Arc<Hub>, mut cancel: watch::Receiver<bool>) {
    let mut updates = BroadcastStream::new(hub.keying.subscribe_updates());
    let mut events = BroadcastStream::new(hub.keying.subscribe_events());
    loop {
        tokio::select! {
            item = updates.next() => {
                match item {
                    Some(Ok(snapshot)) => hub.broadcast(envelope(MessageType::SourceNodeKeying, snapshot_to_json(&snapshot))),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            item = events.next() => {
                match item {
                    Some(Ok(event)) => hub.broadcast(envelope(MessageType::SourceNodeKeyingEvent, keying_event_to_json(&event))),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            _ = cancel.changed() => { if *cancel.borrow() { return; } }
        }
    }
}

fn snapshot_to_json(snapshot: &crate::keying::KeyingSnapshot) -> serde_json::Value {
    serde_json::json!({
        "sourceNodeId": snapshot.source_node_id,
        "adjacentNodes": snapshot.adjacent_nodes.iter().map(|a| serde_json::json!({
            "nodeId": a.node_id,
            "isKeyed": a.is_keyed,
            "isTransmitting": a.is_transmitting,
            "keyedStartTime": a.keyed_start_time,
            "totalTxSeconds": a.total_tx_seconds,
            "pendingUnkey": a.pending_unkey,
            "nodeCallsign": a.node_callsign,
            "nodeDescription": a.node_description,
            "ip": a.ip,
        })).collect::<Vec<_>>(),
        "txKeyed": snapshot.tx_keyed,
        "rxKeyed": snapshot.rx_keyed,
        "timestamp": snapshot.timestamp,
    })
}

fn keying_event_to_json(event: &crate::keying::KeyingEvent) -> serde_json::Value {
    let kind = match event.kind {
        crate::keying::KeyingEventKind::TxStart => "TX_START",
        crate::keying::KeyingEventKind::TxEnd => "TX_END",
    };
    serde_json::json!({
        "type": kind,
        "sourceNodeId": event.source_node_id,
        "nodeId": event.node_id,
        "start": event.start,
        "end": event.end,
        "durationS": event.duration_s,
    })
}

/// Coalesces per-link TX edges over `tx_batch_window` into a single
/// `LINK_TX_BATCH` frame (spec.md §4.6).
async fn batch_tx_events(hub: Arc<Hub>, mut cancel: watch::Receiver<bool>) {
    let mut stream = BroadcastStream::new(hub.state.subscribe_tx_events());
    let mut pending: Vec<TxEvent> = Vec::new();
    let window = hub.tx_batch_window;

    loop {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok(event)) => pending.push(event),
                    Some(Err(_)) => continue,
                    None => return,
                }
            }
            _ = &mut deadline => {
                if !pending.is_empty() {
                    let batch: Vec<_> = pending.drain(..).collect();
                    hub.broadcast(envelope(MessageType::LinkTxBatch, batch));
                }
            }
            _ = cancel.changed() => { if *cancel.borrow() { return; } }
        }
    }
}

async fn heartbeat_loop(hub: Arc<Hub>, mut cancel: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(hub.heartbeat_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for snapshot in hub.state.snapshots() {
                    hub.broadcast(envelope(MessageType::StatusUpdate, snapshot));
                }
            }
            _ = cancel.changed() => { if *cancel.borrow() { return; } }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validator_allows_nonempty_token_and_flags_admin() {
        let validator = default_validator(false);
        assert_eq!(validator(Some("admin")), (true, true));
        assert_eq!(validator(Some("xyz")), (true, false));
        assert_eq!(validator(Some("")), (false, false));
        assert_eq!(validator(None), (false, false));
    }

    #[test]
    fn default_validator_falls_back_to_anonymous_flag() {
        let validator = default_validator(true);
        assert_eq!(validator(None), (true, false));
    }
}

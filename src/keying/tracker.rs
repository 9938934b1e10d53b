use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Notify};
use tracing::instrument;

use crate::state::{Direction, LinkMode};

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyingEventKind {
    TxStart,
    TxEnd,
}

#[derive(Debug, Clone)]
pub struct KeyingEvent {
    pub kind: KeyingEventKind,
    pub source_node_id: i64,
    pub node_id: i64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_s: Option<i64>,
}

/// Enrichment an incoming ALINKS/XStat observation carries for an adjacent
/// node, independent of its keyed state.
#[derive(Debug, Clone, Default)]
pub struct AdjacentObservation {
    pub node_id: i64,
    pub is_keyed: bool,
    pub node_callsign: String,
    pub node_description: String,
    pub mode: Option<LinkMode>,
    pub direction: Direction,
    pub ip: String,
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AdjacentNodeStatus {
    pub node_id: i64,
    pub is_keyed: bool,
    pub is_transmitting: bool,
    pub keyed_start_time: Option<DateTime<Utc>>,
    pub total_tx_seconds: i64,
    pub pending_unkey: bool,
    pub node_callsign: String,
    pub node_description: String,
    pub mode: Option<LinkMode>,
    pub direction: Direction,
    pub ip: String,
    pub connected_since: Option<DateTime<Utc>>,
    timer_generation: u64,
}

impl AdjacentNodeStatus {
    fn new(node_id: i64) -> Self {
        AdjacentNodeStatus {
            node_id,
            is_keyed: false,
            is_transmitting: false,
            keyed_start_time: None,
            total_tx_seconds: 0,
            pending_unkey: false,
            node_callsign: String::new(),
            node_description: String::new(),
            mode: None,
            direction: Direction::Unknown,
            ip: String::new(),
            connected_since: None,
            timer_generation: 0,
        }
    }

    fn apply_enrichment(&mut self, obs: &AdjacentObservation) {
        self.node_callsign = obs.node_callsign.clone();
        self.node_description = obs.node_description.clone();
        self.mode = obs.mode;
        self.direction = obs.direction;
        self.ip = obs.ip.clone();
        if obs.connected_since.is_some() {
            self.connected_since = obs.connected_since;
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyingSnapshot {
    pub source_node_id: i64,
    pub adjacent_nodes: Vec<AdjacentNodeStatus>,
    pub tx_keyed: bool,
    pub rx_keyed: bool,
    pub timestamp: DateTime<Utc>,
}

struct SourceState {
    adjacents: HashMap<i64, AdjacentNodeStatus>,
    tx_keyed: bool,
    rx_keyed: bool,
}

impl SourceState {
    fn new() -> Self {
        SourceState {
            adjacents: HashMap::new(),
            tx_keyed: false,
            rx_keyed: false,
        }
    }
}

struct Shared {
    sources: Mutex<HashMap<i64, SourceState>>,
    timers: Mutex<BinaryHeap<Reverse<(Instant, i64, i64, u64)>>>,
    notify: Notify,
    delay: Duration,
    updates_tx: broadcast::Sender<KeyingSnapshot>,
    events_tx: broadcast::Sender<KeyingEvent>,
}

/// Per-source-node adjacent-transmit state machine with a delayed-unkey
/// timer queue implementing jitter compensation (spec.md §4.3).
pub struct KeyingTracker {
    shared: Arc<Shared>,
}

impl KeyingTracker {
    pub fn new(configured_nodes: &[i64], delay_ms: u64) -> Arc<Self> {
        let mut sources = HashMap::new();
        for &node in configured_nodes {
            sources.insert(node, SourceState::new());
        }
        let (updates_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(KeyingTracker {
            shared: Arc::new(Shared {
                sources: Mutex::new(sources),
                timers: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                delay: Duration::from_millis(delay_ms),
                updates_tx,
                events_tx,
            }),
        })
    }

    /// Spawns the background drain loop that fires matured unkey timers
    /// even when no new ALINKS snapshot arrives to trigger a drain.
    pub fn start(self: &Arc<Self>, cancel: watch::Receiver<bool>) {
        tokio::spawn(Self::run_drain_loop(self.shared.clone(), cancel));
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<KeyingSnapshot> {
        self.shared.updates_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<KeyingEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn snapshot(&self, source_node: i64) -> Option<KeyingSnapshot> {
        let sources = self.shared.sources.lock().expect("keying state poisoned");
        sources.get(&source_node).map(|state| materialize(source_node, state))
    }

    /// Applies one ALINKS (or XStat) observation round for `source_node`,
    /// per the processing order in spec.md §4.3.
    #[instrument(skip(self, observations))]
    pub fn apply_snapshot(
        &self,
        source_node: i64,
        now: DateTime<Utc>,
        observations: Vec<AdjacentObservation>,
        tx_keyed: bool,
        rx_keyed: bool,
    ) {
        let mut events = Vec::new();

        // Step 1: drain matured timers before processing new keying data.
        drain_due_timers(&self.shared, Instant::now(), now, &mut events);

        let mut sources = self.shared.sources.lock().expect("keying state poisoned");
        let state = sources.entry(source_node).or_insert_with(SourceState::new);
        state.tx_keyed = tx_keyed;
        state.rx_keyed = rx_keyed;

        let seen: HashSet<i64> = observations.iter().map(|o| o.node_id).collect();

        // Step 2: apply the keyed flag for every node in the snapshot.
        for obs in &observations {
            let status = state
                .adjacents
                .entry(obs.node_id)
                .or_insert_with(|| AdjacentNodeStatus::new(obs.node_id));
            status.apply_enrichment(obs);
            apply_keyed_transition(
                &self.shared,
                source_node,
                status,
                obs.is_keyed,
                now,
                &mut events,
            );
        }

        // Step 3: nodes that dropped out of the snapshot while transmitting
        // are treated as an unkey observation.
        let dropped: Vec<i64> = state
            .adjacents
            .iter()
            .filter(|(id, status)| !seen.contains(id) && status.is_transmitting)
            .map(|(id, _)| *id)
            .collect();
        for node_id in dropped {
            if let Some(status) = state.adjacents.get_mut(&node_id) {
                apply_keyed_transition(&self.shared, source_node, status, false, now, &mut events);
            }
        }

        let snapshot = materialize(source_node, state);
        drop(sources);

        let _ = self.shared.updates_tx.send(snapshot);
        for event in events {
            let _ = self.shared.events_tx.send(event);
        }
        self.shared.notify.notify_one();
    }

    async fn run_drain_loop(shared: Arc<Shared>, mut cancel: watch::Receiver<bool>) {
        loop {
            if *cancel.borrow() {
                return;
            }
            let next_fire = shared.timers.lock().expect("timer queue poisoned").peek().map(|Reverse((at, ..))| *at);

            let deadline = next_fire.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.into()) => {}
                _ = shared.notify.notified() => { continue; }
                _ = cancel.changed() => { return; }
            }

            let mut events = Vec::new();
            drain_due_timers(&shared, Instant::now(), Utc::now(), &mut events);
            for event in events {
                let _ = shared.events_tx.send(event);
            }
        }
    }
}

fn materialize(source_node: i64, state: &SourceState) -> KeyingSnapshot {
    let mut adjacent_nodes: Vec<AdjacentNodeStatus> = state.adjacents.values().cloned().collect();
    adjacent_nodes.sort_by_key(|a| a.node_id);
    KeyingSnapshot {
        source_node_id: source_node,
        adjacent_nodes,
        tx_keyed: state.tx_keyed,
        rx_keyed: state.rx_keyed,
        timestamp: Utc::now(),
    }
}

/// Applies the state-machine row from spec.md §4.3 for one `(source_node,
/// node)` pair given a new keyed observation.
fn apply_keyed_transition(
    shared: &Shared,
    source_node: i64,
    status: &mut AdjacentNodeStatus,
    keyed: bool,
    now: DateTime<Utc>,
    events: &mut Vec<KeyingEvent>,
) {
    match (status.is_transmitting, status.pending_unkey, keyed) {
        (false, _, true) => {
            status.is_transmitting = true;
            status.is_keyed = true;
            status.pending_unkey = false;
            status.keyed_start_time = Some(now);
            status.timer_generation += 1;
            events.push(KeyingEvent {
                kind: KeyingEventKind::TxStart,
                source_node_id: source_node,
                node_id: status.node_id,
                start: now,
                end: None,
                duration_s: None,
            });
        }
        (false, _, false) => {
            status.is_keyed = false;
        }
        (true, false, true) => {
            status.is_keyed = true;
        }
        (true, false, false) => {
            status.is_keyed = false;
            status.pending_unkey = true;
            status.timer_generation += 1;
            schedule_timer(shared, source_node, status.node_id, status.timer_generation);
        }
        (true, true, true) => {
            status.is_keyed = true;
            status.pending_unkey = false;
            status.timer_generation += 1;
        }
        (true, true, false) => {
            // Timer already pending; nothing to do.
        }
    }
}

fn schedule_timer(shared: &Shared, source_node: i64, node_id: i64, generation: u64) {
    let fire_at = Instant::now() + shared.delay;
    shared
        .timers
        .lock()
        .expect("timer queue poisoned")
        .push(Reverse((fire_at, source_node, node_id, generation)));
    shared.notify.notify_one();
}

/// Pops and evaluates every timer with `fire_at <= monotonic_now`. Stale
/// entries (superseded by a re-key) are dropped silently by generation
/// comparison rather than removed from the heap eagerly.
fn drain_due_timers(
    shared: &Shared,
    monotonic_now: Instant,
    wall_now: DateTime<Utc>,
    events: &mut Vec<KeyingEvent>,
) {
    loop {
        let due = {
            let mut timers = shared.timers.lock().expect("timer queue poisoned");
            match timers.peek() {
                Some(Reverse((fire_at, ..))) if *fire_at <= monotonic_now => timers.pop(),
                _ => None,
            }
        };
        let Some(Reverse((_, source_node, node_id, generation))) = due else {
            break;
        };

        let mut sources = shared.sources.lock().expect("keying state poisoned");
        let Some(state) = sources.get_mut(&source_node) else {
            continue;
        };
        let Some(status) = state.adjacents.get_mut(&node_id) else {
            continue;
        };
        if status.timer_generation != generation || !status.pending_unkey || status.is_keyed {
            continue;
        }

        let start = status.keyed_start_time.unwrap_or(wall_now);
        let duration = (wall_now - start).num_seconds().max(0);
        status.total_tx_seconds += duration;
        status.is_transmitting = false;
        status.pending_unkey = false;
        status.keyed_start_time = None;

        events.push(KeyingEvent {
            kind: KeyingEventKind::TxEnd,
            source_node_id: source_node,
            node_id,
            start,
            end: Some(wall_now),
            duration_s: Some(duration),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(node_id: i64, keyed: bool) -> AdjacentObservation {
        AdjacentObservation {
            node_id,
            is_keyed: keyed,
            ..Default::default()
        }
    }

    #[test]
    fn idle_to_transmitting_emits_tx_start() {
        let tracker = KeyingTracker::new(&[594950], 2000);
        let mut events = tracker.subscribe_events();
        let t0 = Utc::now();

        tracker.apply_snapshot(594950, t0, vec![observation(634021, true)], true, false);

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, KeyingEventKind::TxStart);
        assert_eq!(event.node_id, 634021);
    }

    #[test]
    fn rekey_before_timer_fires_does_not_double_start() {
        let tracker = KeyingTracker::new(&[594950], 2000);
        let mut events = tracker.subscribe_events();
        let t0 = Utc::now();

        tracker.apply_snapshot(594950, t0, vec![observation(634021, true)], true, false);
        events.try_recv().unwrap(); // TX_START

        tracker.apply_snapshot(594950, t0 + chrono::Duration::milliseconds(100), vec![observation(634021, false)], false, false);
        assert!(events.try_recv().is_err());

        tracker.apply_snapshot(594950, t0 + chrono::Duration::milliseconds(500), vec![observation(634021, true)], true, false);
        assert!(events.try_recv().is_err(), "re-key should cancel the pending unkey, not start a new session");

        let snapshot = tracker.snapshot(594950).unwrap();
        let status = &snapshot.adjacent_nodes[0];
        assert!(status.is_transmitting);
        assert!(!status.pending_unkey);
    }

    #[test]
    fn dropped_node_while_transmitting_schedules_unkey() {
        let tracker = KeyingTracker::new(&[594950], 2000);
        let t0 = Utc::now();
        tracker.apply_snapshot(594950, t0, vec![observation(634021, true)], true, false);
        tracker.apply_snapshot(594950, t0 + chrono::Duration::seconds(1), vec![], false, false);

        let snapshot = tracker.snapshot(594950).unwrap();
        let status = &snapshot.adjacent_nodes[0];
        assert!(status.pending_unkey);
        assert!(status.is_transmitting);
    }
}

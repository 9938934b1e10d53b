use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::ami::Message;
use crate::persistence::LinkStat;

use super::node::{Direction, LinkInfo, LinkMode, NodeState, TxEdge};
use super::registry::TextNodeRegistry;
use super::talker::{TalkerEvent, TalkerKind, TalkerLog};

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;
const LINK_DIFF_CHANNEL_CAPACITY: usize = 256;
const TX_EVENT_CHANNEL_CAPACITY: usize = 512;
const TALKER_CHANNEL_CAPACITY: usize = 256;

/// A single per-link transmit edge, published after every apply or poll
/// merge that flips a link's `current_tx` (spec.md §4.2 step 3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TxEvent {
    pub node: i64,
    pub source_node: i64,
    pub edge: TxEdge,
    pub at: DateTime<Utc>,
    pub total_tx_seconds: i64,
    pub last_tx_start: Option<DateTime<Utc>>,
    pub last_tx_end: Option<DateTime<Utc>>,
}

/// Invoked with the full current link list for a source node whenever a TX
/// edge occurs, so persistence can upsert cumulative totals. Implementations
/// must not block the caller — spec.md §5 requires the state mutex's
/// critical section to stay free of I/O.
pub trait PersistenceHook: Send + Sync {
    fn on_link_batch(&self, source_node: i64, links: Vec<LinkInfo>);
}

/// An XStat `Conn:` line, used by the polling service's merge step.
#[derive(Debug, Clone)]
pub struct XStatConnection {
    pub node: i64,
    pub ip: String,
    pub is_keyed: bool,
    pub direction: Direction,
    pub elapsed: String,
    pub link_type: String,
    pub mode: Option<LinkMode>,
    pub node_callsign: String,
    pub node_description: String,
    pub node_location: String,
}

/// A SawStat `Conn:` line.
#[derive(Debug, Clone)]
pub struct SawStatEntry {
    pub node: i64,
    pub secs_since_keyed: i64,
}

/// Result of a combined XStat/SawStat merge: what to publish, and the set
/// of node ids the polling service's cleanup callback should treat as live.
pub struct CombinedStatusResult {
    pub added: Vec<LinkInfo>,
    pub removed: Vec<i64>,
    pub live_node_ids: Vec<i64>,
}

struct NodeEntry {
    state: NodeState,
    links: HashMap<i64, LinkInfo>,
}

impl NodeEntry {
    fn new(node_id: i64, title: String, subtitle: String) -> Self {
        NodeEntry {
            state: NodeState::new(node_id, title, subtitle),
            links: HashMap::new(),
        }
    }
}

/// Owns the authoritative `NodeState`/`LinkInfo` model for every configured
/// source node and fans out diffs. This is the composition root for the
/// event-driven pipeline (spec.md §4.2).
pub struct StateManager {
    registry: Arc<TextNodeRegistry>,
    nodes: Mutex<HashMap<i64, NodeEntry>>,
    talker: Mutex<TalkerLog>,
    persistence_hook: Mutex<Option<Arc<dyn PersistenceHook>>>,
    created_at: Instant,
    default_node: Option<i64>,

    snapshot_tx: broadcast::Sender<NodeState>,
    link_added_tx: broadcast::Sender<Vec<LinkInfo>>,
    link_removed_tx: broadcast::Sender<Vec<i64>>,
    tx_event_tx: broadcast::Sender<TxEvent>,
    talker_tx: broadcast::Sender<TalkerEvent>,
}

impl StateManager {
    pub fn new(configured_nodes: &[(i64, Option<String>)], title: &str, subtitle: &str) -> Arc<Self> {
        let mut nodes = HashMap::new();
        for (node_id, display_name) in configured_nodes {
            let node_title = display_name.clone().unwrap_or_else(|| title.to_string());
            nodes.insert(*node_id, NodeEntry::new(*node_id, node_title, subtitle.to_string()));
        }

        let default_node = if configured_nodes.len() == 1 {
            Some(configured_nodes[0].0)
        } else {
            None
        };

        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (link_added_tx, _) = broadcast::channel(LINK_DIFF_CHANNEL_CAPACITY);
        let (link_removed_tx, _) = broadcast::channel(LINK_DIFF_CHANNEL_CAPACITY);
        let (tx_event_tx, _) = broadcast::channel(TX_EVENT_CHANNEL_CAPACITY);
        let (talker_tx, _) = broadcast::channel(TALKER_CHANNEL_CAPACITY);

        Arc::new(StateManager {
            registry: Arc::new(TextNodeRegistry::new()),
            nodes: Mutex::new(nodes),
            talker: Mutex::new(TalkerLog::new()),
            persistence_hook: Mutex::new(None),
            created_at: Instant::now(),
            default_node,
            snapshot_tx,
            link_added_tx,
            link_removed_tx,
            tx_event_tx,
            talker_tx,
        })
    }

    pub fn set_persistence_hook(&self, hook: Arc<dyn PersistenceHook>) {
        *self.persistence_hook.lock().expect("persistence hook lock poisoned") = Some(hook);
    }

    pub fn registry(&self) -> Arc<TextNodeRegistry> {
        self.registry.clone()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<NodeState> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe_link_added(&self) -> broadcast::Receiver<Vec<LinkInfo>> {
        self.link_added_tx.subscribe()
    }

    pub fn subscribe_link_removed(&self) -> broadcast::Receiver<Vec<i64>> {
        self.link_removed_tx.subscribe()
    }

    pub fn subscribe_tx_events(&self) -> broadcast::Receiver<TxEvent> {
        self.tx_event_tx.subscribe()
    }

    pub fn subscribe_talker(&self) -> broadcast::Receiver<TalkerEvent> {
        self.talker_tx.subscribe()
    }

    pub fn talker_snapshot(&self) -> Vec<TalkerEvent> {
        self.talker.lock().expect("talker log poisoned").snapshot(Utc::now())
    }

    pub fn snapshot(&self, source_node: i64) -> Option<NodeState> {
        self.nodes
            .lock()
            .expect("node table poisoned")
            .get(&source_node)
            .map(|entry| self.materialize(entry))
    }

    pub fn snapshots(&self) -> Vec<NodeState> {
        self.nodes
            .lock()
            .expect("node table poisoned")
            .values()
            .map(|entry| self.materialize(entry))
            .collect()
    }

    fn materialize(&self, entry: &NodeEntry) -> NodeState {
        let mut state = entry.state.clone();
        state.links_detailed = state
            .links
            .iter()
            .filter_map(|id| entry.links.get(id).cloned())
            .collect();
        state.heartbeat = self.created_at.elapsed().as_millis() as i64;
        state.updated_at = Utc::now();
        state
    }

    /// Installs persisted link stats without emitting add/remove diffs
    /// (spec.md §4.2 Seeding). `local_node` is stamped as `source_node`
    /// directly, satisfying the "must be repaired" invariant at the source.
    pub fn seed_link_stats(&self, source_node: i64, stats: Vec<LinkStat>) {
        let mut nodes = self.nodes.lock().expect("node table poisoned");
        let entry = nodes
            .entry(source_node)
            .or_insert_with(|| NodeEntry::new(source_node, String::new(), String::new()));

        for stat in stats {
            let connected_since = stat.connected_since.unwrap_or_else(Utc::now);
            let mut link = LinkInfo::new(stat.node, source_node, connected_since);
            link.total_tx_seconds = stat.total_tx_seconds;
            link.last_tx_start = stat.last_tx_start;
            link.last_tx_end = stat.last_tx_end;
            entry.links.insert(stat.node, link);
        }
        entry.state.links = entry.links.keys().copied().collect();
    }

    /// Parses and applies one AMI frame, mutating the authoritative model
    /// and publishing the resulting diffs in the order required by
    /// spec.md §5: link-added, link-removed, per-link TX events, talker
    /// events, then the full snapshot.
    pub fn apply(&self, mut message: Message) {
        normalize_headers(&mut message);
        let now = Utc::now();

        if message.get("Banner").is_some() {
            self.reset_boot_fields();
            return;
        }

        if message.event() == Some("FullyBooted") {
            self.mark_fully_booted(now);
            return;
        }

        let source_node = match self.resolve_source_node(&message) {
            Some(id) => id,
            None => {
                debug!("AMI frame has no resolvable source node, ignoring");
                return;
            }
        };

        let links_payload = message.get("RPT_LINKS").map(str::to_string);
        let alinks_payload = message.get("RPT_ALINKS").map(str::to_string);

        if links_payload.is_some() || alinks_payload.is_some() {
            let alinks = alinks_payload
                .as_deref()
                .map(|payload| parse_alinks(payload, &self.registry));

            let link_ids = match (&links_payload, &alinks) {
                (Some(payload), _) => parse_node_list(payload, &self.registry),
                (None, Some((ids, _))) => ids.clone(),
                (None, None) => Vec::new(),
            };

            let keyed_map = alinks.map(|(_, keyed)| keyed);

            self.apply_link_diff(source_node, link_ids, keyed_map, now);
        }

        if let Some(raw) = message.get("RPT_NUMLINKS") {
            if let Ok(value) = raw.trim().parse::<i64>() {
                self.with_entry(source_node, |entry| entry.state.num_links = value);
            }
        }
        if let Some(raw) = message.get("RPT_NUMALINKS") {
            if let Ok(value) = raw.trim().parse::<i64>() {
                self.with_entry(source_node, |entry| entry.state.num_alinks = value);
            }
        }

        if let Some(raw) = message.get("RPT_TXKEYED") {
            let keyed = raw.trim() == "1";
            self.apply_local_tx_edge(source_node, keyed, now);
        }
        if let Some(raw) = message.get("RPT_RXKEYED") {
            let keyed = raw.trim() == "1";
            self.with_entry(source_node, |entry| entry.state.rx_keyed = keyed);
        }

        self.publish_snapshot(source_node);
    }

    /// Merges an XStat/SawStat poll result into the model (spec.md §4.4
    /// `apply_combined_status`).
    pub fn apply_combined_status(
        &self,
        source_node: i64,
        connections: Vec<XStatConnection>,
        saw_stats: Vec<SawStatEntry>,
        rx_keyed: Option<bool>,
        tx_keyed: Option<bool>,
    ) -> CombinedStatusResult {
        let now = Utc::now();
        let current: HashMap<i64, XStatConnection> =
            connections.into_iter().map(|c| (c.node, c)).collect();
        let saw_by_node: HashMap<i64, &SawStatEntry> =
            saw_stats.iter().map(|s| (s.node, s)).collect();

        let mut nodes = self.nodes.lock().expect("node table poisoned");
        let entry = nodes
            .entry(source_node)
            .or_insert_with(|| NodeEntry::new(source_node, String::new(), String::new()));

        let mut removed = Vec::new();
        let mut preserved_elsewhere: HashSet<i64> = HashSet::new();

        for (&id, link) in entry.links.iter() {
            let owned_by_us = link.local_node == 0 || link.local_node == source_node;
            if !owned_by_us {
                preserved_elsewhere.insert(id);
                continue;
            }
            if !current.contains_key(&id) {
                removed.push(id);
            }
        }
        for id in &removed {
            entry.links.remove(id);
        }

        let mut added = Vec::new();
        let mut tx_events = Vec::new();

        for (&id, conn) in current.iter() {
            if preserved_elsewhere.contains(&id) {
                continue;
            }
            let is_new = !entry.links.contains_key(&id);
            let link = entry
                .links
                .entry(id)
                .or_insert_with(|| LinkInfo::new(id, source_node, now));

            link.local_node = source_node;
            link.ip = conn.ip.clone();
            link.direction = conn.direction;
            link.elapsed = conn.elapsed.clone();
            link.link_type = conn.link_type.clone();
            link.mode = conn.mode;
            link.node_callsign = conn.node_callsign.clone();
            link.node_description = conn.node_description.clone();
            link.node_location = conn.node_location.clone();

            if let Some(saw) = saw_by_node.get(&id) {
                link.secs_since_keyed = Some(saw.secs_since_keyed);
                if saw.secs_since_keyed > 0 {
                    link.last_keyed_time =
                        Some(now - chrono::Duration::seconds(saw.secs_since_keyed));
                }
            }

            if let Some(edge) = link.update_tx(conn.is_keyed, now) {
                tx_events.push(TxEvent {
                    node: id,
                    source_node,
                    edge,
                    at: now,
                    total_tx_seconds: link.total_tx_seconds,
                    last_tx_start: link.last_tx_start,
                    last_tx_end: link.last_tx_end,
                });
            }

            if is_new {
                added.push(link.clone());
            }
        }

        if let Some(keyed) = rx_keyed {
            entry.state.rx_keyed = keyed;
        }
        if let Some(keyed) = tx_keyed {
            entry.state.tx_keyed = keyed;
        }

        entry.state.links = entry.links.keys().copied().collect();
        let live_node_ids: Vec<i64> = current.keys().copied().collect();
        let batch: Vec<LinkInfo> = entry.links.values().cloned().collect();
        drop(nodes);

        if !added.is_empty() {
            let _ = self.link_added_tx.send(added.clone());
        }
        if !removed.is_empty() {
            let _ = self.link_removed_tx.send(removed.clone());
        }
        for event in &tx_events {
            self.emit_tx_event(event.clone());
        }
        if !tx_events.is_empty() {
            self.invoke_persistence_hook(source_node, batch);
        }
        self.publish_snapshot(source_node);

        CombinedStatusResult {
            added,
            removed,
            live_node_ids,
        }
    }

    fn apply_link_diff(
        &self,
        source_node: i64,
        link_ids: Vec<i64>,
        keyed_map: Option<HashMap<i64, bool>>,
        now: DateTime<Utc>,
    ) {
        let mut nodes = self.nodes.lock().expect("node table poisoned");
        let entry = nodes
            .entry(source_node)
            .or_insert_with(|| NodeEntry::new(source_node, String::new(), String::new()));

        let current_set: HashSet<i64> = link_ids.iter().copied().collect();
        let previous_set: HashSet<i64> = entry.links.keys().copied().collect();

        let mut added = Vec::new();
        for &id in &link_ids {
            if !entry.links.contains_key(&id) {
                let link = LinkInfo::new(id, source_node, now);
                entry.links.insert(id, link.clone());
                added.push(link);
            }
        }

        let removed: Vec<i64> = previous_set.difference(&current_set).copied().collect();
        for id in &removed {
            entry.links.remove(id);
        }

        let mut tx_events = Vec::new();
        if let Some(keyed_map) = &keyed_map {
            for &id in &link_ids {
                if let Some(link) = entry.links.get_mut(&id) {
                    let is_keyed = keyed_map.get(&id).copied().unwrap_or(false);
                    if let Some(edge) = link.update_tx(is_keyed, now) {
                        tx_events.push(TxEvent {
                            node: id,
                            source_node,
                            edge,
                            at: now,
                            total_tx_seconds: link.total_tx_seconds,
                            last_tx_start: link.last_tx_start,
                            last_tx_end: link.last_tx_end,
                        });
                    }
                }
            }
        }

        entry.state.links = link_ids;
        let batch: Vec<LinkInfo> = entry.links.values().cloned().collect();
        drop(nodes);

        if !added.is_empty() {
            let _ = self.link_added_tx.send(added);
        }
        if !removed.is_empty() {
            let _ = self.link_removed_tx.send(removed);
        }
        for event in &tx_events {
            self.emit_tx_event(event.clone());
        }
        if !tx_events.is_empty() {
            self.invoke_persistence_hook(source_node, batch);
        }
    }

    fn apply_local_tx_edge(&self, source_node: i64, keyed: bool, now: DateTime<Utc>) {
        let was_keyed = self
            .nodes
            .lock()
            .expect("node table poisoned")
            .get(&source_node)
            .map(|entry| entry.state.tx_keyed)
            .unwrap_or(false);

        self.with_entry(source_node, |entry| entry.state.tx_keyed = keyed);

        if was_keyed == keyed {
            return;
        }

        let kind = if keyed { TalkerKind::TxStart } else { TalkerKind::TxStop };
        self.record_talker(source_node, kind, now, source_node.to_string(), None);
    }

    fn emit_tx_event(&self, event: TxEvent) {
        let (kind, duration) = match event.edge {
            TxEdge::Started => (TalkerKind::TxStart, None),
            TxEdge::Ended { duration_seconds } => (TalkerKind::TxStop, Some(duration_seconds)),
        };
        let callsign = self
            .registry
            .lookup(event.node)
            .unwrap_or_else(|| event.node.to_string());

        self.record_talker(event.node, kind, event.at, callsign, duration);
        let _ = self.tx_event_tx.send(event);
    }

    fn record_talker(
        &self,
        node: i64,
        kind: TalkerKind,
        at: DateTime<Utc>,
        callsign: String,
        duration_s: Option<i64>,
    ) {
        let event = self
            .talker
            .lock()
            .expect("talker log poisoned")
            .try_record(node, kind, at, callsign, duration_s);
        if let Some(event) = event {
            let _ = self.talker_tx.send(event);
        }
    }

    fn invoke_persistence_hook(&self, source_node: i64, links: Vec<LinkInfo>) {
        let hook = self.persistence_hook.lock().expect("persistence hook lock poisoned").clone();
        if let Some(hook) = hook {
            hook.on_link_batch(source_node, links);
        }
    }

    fn publish_snapshot(&self, source_node: i64) {
        if let Some(state) = self.snapshot(source_node) {
            let subscribers = self.snapshot_tx.send(state);
            match subscribers {
                Ok(0) | Err(_) => trace!(source_node, "snapshot published with no subscribers"),
                Ok(_) => {}
            }
        }
    }

    fn reset_boot_fields(&self) {
        let mut nodes = self.nodes.lock().expect("node table poisoned");
        for entry in nodes.values_mut() {
            entry.state.uptime_sec = 0;
            entry.state.last_reload_sec = 0;
            entry.state.booted_at = None;
        }
    }

    fn mark_fully_booted(&self, now: DateTime<Utc>) {
        let mut nodes = self.nodes.lock().expect("node table poisoned");
        for entry in nodes.values_mut() {
            if entry.state.booted_at.is_none() {
                entry.state.booted_at = Some(now);
            }
        }
    }

    fn with_entry<F: FnOnce(&mut NodeEntry)>(&self, source_node: i64, f: F) {
        let mut nodes = self.nodes.lock().expect("node table poisoned");
        let entry = nodes
            .entry(source_node)
            .or_insert_with(|| NodeEntry::new(source_node, String::new(), String::new()));
        f(entry);
    }

    fn resolve_source_node(&self, message: &Message) -> Option<i64> {
        node_header(message).or(self.default_node)
    }
}

/// Synthesizes legacy header keys from `Event`/`EventValue` and `VarSet`
/// payloads so the rest of the pipeline can switch on a flat header set
/// (spec.md §4.2 header normalization).
pub(crate) fn normalize_headers(message: &mut Message) {
    let Some(event) = message.event().map(str::to_string) else {
        return;
    };

    match event.as_str() {
        "RPT_LINKS" | "RPT_ALINKS" | "RPT_TXKEYED" | "RPT_RXKEYED" | "RPT_NUMLINKS"
        | "RPT_NUMALINKS" => {
            if let Some(value) = message.get("EventValue").map(str::to_string) {
                message.set(&event, value);
            }
        }
        "VarSet" => {
            let variable = message.get("Variable").map(str::to_string);
            let value = message.get("Value").map(str::to_string);
            if let (Some(variable), Some(value)) = (variable, value) {
                if variable.starts_with("RPT_") {
                    message.set(&variable, value);
                }
            }
        }
        _ => {}
    }
}

/// Reads and parses the `Node` header, shared by the state manager and the
/// keying tracker so both agree on which source node an AMI frame belongs
/// to.
pub fn node_header(message: &Message) -> Option<i64> {
    message.get("Node").and_then(|raw| raw.trim().parse::<i64>().ok())
}

/// Finds the first maximal run of 3-7 ASCII digits in `token`.
fn extract_digit_run(token: &str) -> Option<i64> {
    let bytes = token.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if (3..=7).contains(&(i - start)) {
                return token[start..i].parse().ok();
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Drops a leading small-integer count token, matching the RPT_LINKS/
/// RPT_ALINKS payload convention (spec.md §4.2).
fn strip_leading_count<'a>(mut tokens: Vec<&'a str>) -> Vec<&'a str> {
    if let Some(first) = tokens.first() {
        if first.len() < 3 && first.parse::<i64>().is_ok() {
            tokens.remove(0);
        }
    }
    tokens
}

fn tokenize(payload: &str) -> Vec<&str> {
    strip_leading_count(
        payload
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect(),
    )
}

fn resolve_token_id(token: &str, registry: &TextNodeRegistry) -> i64 {
    match extract_digit_run(token) {
        Some(id) => id,
        None => registry.hash_and_register(token),
    }
}

pub fn parse_node_list(payload: &str, registry: &TextNodeRegistry) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for token in tokenize(payload) {
        let id = resolve_token_id(token, registry);
        if seen.insert(id) {
            ids.push(id);
        }
    }
    ids
}

pub fn parse_alinks(payload: &str, registry: &TextNodeRegistry) -> (Vec<i64>, HashMap<i64, bool>) {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut keyed = HashMap::new();
    for token in tokenize(payload) {
        let id = resolve_token_id(token, registry);
        let is_keyed = token.ends_with('K') || token.contains("TK");
        if seen.insert(id) {
            ids.push(id);
        }
        keyed.insert(id, is_keyed);
    }
    (ids, keyed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event: &str, value: &str) -> Message {
        let mut msg = Message::default();
        msg.set("Event", event.to_string());
        msg.set("EventValue", value.to_string());
        msg.set("Node", "594950".to_string());
        msg
    }

    #[test]
    fn parses_rpt_links_dropping_leading_count_and_deduping() {
        let registry = TextNodeRegistry::new();
        let ids = parse_node_list("2,588841,588841,590110", &registry);
        assert_eq!(ids, vec![588841, 590110]);
    }

    #[test]
    fn parses_alinks_keyed_markers() {
        let registry = TextNodeRegistry::new();
        let (ids, keyed) = parse_alinks("1,634021TK,590110U", &registry);
        assert_eq!(ids, vec![634021, 590110]);
        assert_eq!(keyed.get(&634021), Some(&true));
        assert_eq!(keyed.get(&590110), Some(&false));
    }

    #[test]
    fn text_only_token_is_hashed_and_registered() {
        let registry = TextNodeRegistry::new();
        let ids = parse_node_list("1,W1AW", &registry);
        assert_eq!(ids.len(), 1);
        assert!(ids[0] < 0);
        assert_eq!(registry.lookup(ids[0]), Some("W1AW".to_string()));
    }

    #[test]
    fn link_add_and_remove_diff() {
        let manager = StateManager::new(&[(594950, None)], "Node", "");
        manager.apply(event("RPT_LINKS", "2,588841,590110"));
        let snapshot = manager.snapshot(594950).unwrap();
        assert_eq!(snapshot.links, vec![588841, 590110]);

        manager.apply(event("RPT_LINKS", "1,588841"));
        let snapshot = manager.snapshot(594950).unwrap();
        assert_eq!(snapshot.links, vec![588841]);
        assert_eq!(snapshot.links_detailed.len(), 1);
    }

    #[test]
    fn applying_same_rpt_links_twice_is_idempotent() {
        let manager = StateManager::new(&[(594950, None)], "Node", "");
        manager.apply(event("RPT_LINKS", "2,588841,590110"));
        let mut added_rx = manager.subscribe_link_added();
        manager.apply(event("RPT_LINKS", "2,588841,590110"));
        assert!(added_rx.try_recv().is_err());
    }

    #[test]
    fn rpt_alinks_keyed_edge_emits_tx_event() {
        let manager = StateManager::new(&[(594950, None)], "Node", "");
        let mut tx_rx = manager.subscribe_tx_events();

        manager.apply(event("RPT_ALINKS", "1,634021TK"));
        let ev = tx_rx.try_recv().expect("expected a tx event");
        assert_eq!(ev.node, 634021);
        assert!(matches!(ev.edge, TxEdge::Started));
    }

    #[test]
    fn seed_link_stats_repairs_local_node_without_diff() {
        let manager = StateManager::new(&[(594950, None)], "Node", "");
        let mut added_rx = manager.subscribe_link_added();
        manager.seed_link_stats(
            594950,
            vec![LinkStat {
                node: 100,
                total_tx_seconds: 42,
                last_tx_start: None,
                last_tx_end: None,
                connected_since: None,
                updated_at: Utc::now(),
            }],
        );
        assert!(added_rx.try_recv().is_err());
        let snapshot = manager.snapshot(594950).unwrap();
        assert_eq!(snapshot.links_detailed[0].local_node, 594950);
        assert_eq!(snapshot.links_detailed[0].total_tx_seconds, 42);
    }
}

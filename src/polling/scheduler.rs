use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, instrument, warn};

use crate::ami::{ActionContext, AmiClient};
use crate::errors::AmiError;
use crate::keying::{AdjacentObservation, KeyingTracker};
use crate::persistence::{LinkStatsRepository, NodeInfoRepository};
use crate::state::StateManager;

use super::parsing::{parse_sawstat, parse_xstat};

const FIRST_TICK_DELAY: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const TRIGGER_CHANNEL_CAPACITY: usize = 32;
const TRIGGER_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum PollCommand {
    AllNodes,
    Node(i64),
}

/// Per-source-node XStat/SawStat scheduler that merges enriched link data
/// back into the state manager and keying tracker (spec.md §4.4).
pub struct PollingService {
    ami: AmiClient,
    state: Arc<StateManager>,
    keying: Arc<KeyingTracker>,
    link_stats: Arc<LinkStatsRepository>,
    node_info: Arc<NodeInfoRepository>,
    nodes: Vec<i64>,
    interval: Duration,
    trigger_tx: broadcast::Sender<PollCommand>,
    last_triggered: Mutex<Option<Instant>>,
}

impl PollingService {
    pub fn new(
        ami: AmiClient,
        state: Arc<StateManager>,
        keying: Arc<KeyingTracker>,
        link_stats: Arc<LinkStatsRepository>,
        node_info: Arc<NodeInfoRepository>,
        nodes: Vec<i64>,
        interval: Duration,
    ) -> Arc<Self> {
        let (trigger_tx, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        Arc::new(PollingService {
            ami,
            state,
            keying,
            link_stats,
            node_info,
            nodes,
            interval,
            trigger_tx,
            last_triggered: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, cancel: watch::Receiver<bool>) {
        for &node in &self.nodes {
            let service = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run_scheduler(node, cancel).await });
        }
    }

    /// Triggers an immediate poll of every configured node, debounced so a
    /// burst of new WebSocket connections issues at most one poll per
    /// debounce window.
    pub async fn trigger_poll_once(&self) {
        let mut last = self.last_triggered.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < TRIGGER_DEBOUNCE {
                return;
            }
        }
        *last = Some(Instant::now());
        let _ = self.trigger_tx.send(PollCommand::AllNodes);
    }

    pub fn trigger_poll_node(&self, node_id: i64) {
        let _ = self.trigger_tx.send(PollCommand::Node(node_id));
    }

    async fn run_scheduler(&self, node_id: i64, mut cancel: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(FIRST_TICK_DELAY) => {}
            _ = cancel.changed() => if *cancel.borrow() { return; },
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        let mut trigger_rx = self.trigger_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                result = trigger_rx.recv() => {
                    match result {
                        Ok(PollCommand::AllNodes) | Ok(PollCommand::Node(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = cancel.changed() => { if *cancel.borrow() { return; } }
            }

            if !self.ami.is_connected() {
                info!(node_id, "skipping poll tick, AMI not connected");
                continue;
            }

            if let Err(error) = self.poll_node(node_id).await {
                warn!(node_id, %error, "poll failed");
            }
        }
    }

    #[instrument(skip(self))]
    async fn poll_node(&self, node_id: i64) -> Result<(), AmiError> {
        let ctx = ActionContext::with_timeout(POLL_TIMEOUT);
        let xstat = self
            .ami
            .send_action(
                ctx,
                vec![
                    ("Action".into(), "RptStatus".into()),
                    ("COMMAND".into(), "XStat".into()),
                    ("NODE".into(), node_id.to_string()),
                ],
            )
            .await?;

        let ctx = ActionContext::with_timeout(POLL_TIMEOUT);
        let sawstat = self
            .ami
            .send_action(
                ctx,
                vec![
                    ("Action".into(), "RptStatus".into()),
                    ("COMMAND".into(), "SawStat".into()),
                    ("NODE".into(), node_id.to_string()),
                ],
            )
            .await?;

        let (mut connections, rx_keyed, tx_keyed) = parse_xstat(&xstat.raw_lines);
        let saw_stats = parse_sawstat(&sawstat.raw_lines);

        for conn in &mut connections {
            let (callsign, description, location) = self.enrich(conn.node).await;
            conn.node_callsign = callsign;
            conn.node_description = description;
            conn.node_location = location;
        }

        let observations: Vec<AdjacentObservation> = connections
            .iter()
            .map(|conn| AdjacentObservation {
                node_id: conn.node,
                is_keyed: conn.is_keyed,
                node_callsign: conn.node_callsign.clone(),
                node_description: conn.node_description.clone(),
                mode: conn.mode,
                direction: conn.direction,
                ip: conn.ip.clone(),
                connected_since: None,
            })
            .collect();

        self.state
            .apply_combined_status(node_id, connections, saw_stats, rx_keyed, tx_keyed);

        self.keying.apply_snapshot(
            node_id,
            chrono::Utc::now(),
            observations,
            tx_keyed.unwrap_or(false),
            rx_keyed.unwrap_or(false),
        );

        self.reconcile(node_id).await;
        Ok(())
    }

    /// Looks up identity enrichment for an adjacent node (spec.md §4.5:
    /// "used on every enrichment"). A miss or lookup failure yields empty
    /// fields rather than failing the poll.
    async fn enrich(&self, node_id: i64) -> (String, String, String) {
        match self.node_info.get_by_node_id(node_id).await {
            Ok(Some(info)) => (info.callsign, info.description, info.location),
            Ok(None) => (String::new(), String::new(), String::new()),
            Err(error) => {
                warn!(node_id, %error, "node_info enrichment lookup failed");
                (String::new(), String::new(), String::new())
            }
        }
    }

    /// Reconciles persistence against the live link set, repairing any
    /// stale seeding from a prior run (spec.md §4.4). `link_stats` has no
    /// source-node column (spec.md §3 LinkStat), so the delete side must be
    /// driven by the union of every configured source's current links, not
    /// just this poll's node — otherwise a second source node's links would
    /// be pruned as a side effect of the first source's poll.
    async fn reconcile(&self, node_id: i64) {
        let Some(snapshot) = self.state.snapshot(node_id) else {
            return;
        };
        if let Err(error) = self.link_stats.upsert_batch(&snapshot.links_detailed).await {
            warn!(node_id, %error, "failed to upsert link stats after poll");
        }

        let all_live: Vec<i64> = self
            .state
            .snapshots()
            .into_iter()
            .flat_map(|s| s.links)
            .collect();

        match self.link_stats.delete_not_in(&all_live).await {
            Ok(deleted) if deleted > 0 => {
                info!(node_id, deleted, "pruned stale link_stats rows after poll");
            }
            Ok(_) => {}
            Err(error) => warn!(node_id, %error, "failed to prune stale link_stats rows"),
        }
    }
}

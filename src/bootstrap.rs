use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::StreamExt as _;
use tracing::{info, warn};

use crate::ami::AmiClient;
use crate::config::Config;
use crate::keying::{AdjacentObservation, KeyingTracker};
use crate::persistence::{LinkStatsRepository, NodeInfoRepository, PersistenceClient};
use crate::polling::PollingService;
use crate::routes::{build_router, AppState};
use crate::services::AstdbImporter;
use crate::state::manager::normalize_headers;
use crate::state::{node_header, parse_alinks, LinkInfo, PersistenceHook, StateManager};
use crate::ws::{default_validator, Hub};

/// Forwards confirmed TX-edge batches to the link_stats table without
/// blocking the state manager's critical section (spec.md §4.5).
struct LinkStatsPersistenceHook {
    repository: Arc<LinkStatsRepository>,
}

impl PersistenceHook for LinkStatsPersistenceHook {
    fn on_link_batch(&self, source_node: i64, links: Vec<LinkInfo>) {
        let repository = self.repository.clone();
        tokio::spawn(async move {
            if let Err(error) = repository.upsert_batch(&links).await {
                warn!(source_node, %error, "failed to persist link batch after tx edge");
            }
        });
    }
}

/// Wires every component per the dependency order in spec.md §2 and
/// returns the fully assembled router plus the shutdown signal.
pub async fn bootstrap(config: Config) -> anyhow::Result<(axum::Router, watch::Sender<bool>)> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let persistence = PersistenceClient::open(&config.db_path).await?;
    let link_stats = Arc::new(LinkStatsRepository::new(persistence.clone()));
    let node_info = Arc::new(NodeInfoRepository::new(persistence.clone()));

    let ami = AmiClient::new(
        config.ami_host.clone(),
        config.ami_port,
        config.ami_username.clone(),
        config.ami_password.clone(),
        config.ami_events.clone(),
        config.ami_retry_interval,
        config.ami_retry_max,
    );

    let node_ids: Vec<i64> = config.nodes.iter().map(|n| n.node_id).collect();
    let keying = KeyingTracker::new(&node_ids, config.keying_delay_ms);

    let configured_nodes: Vec<(i64, Option<String>)> = config
        .nodes
        .iter()
        .map(|n| (n.node_id, n.display_name.clone()))
        .collect();
    let state = StateManager::new(&configured_nodes, &config.title, &config.subtitle);
    state.set_persistence_hook(Arc::new(LinkStatsPersistenceHook {
        repository: link_stats.clone(),
    }));

    seed_from_persistence(&state, &link_stats).await;

    let polling = PollingService::new(
        ami.clone(),
        state.clone(),
        keying.clone(),
        link_stats.clone(),
        node_info.clone(),
        node_ids.clone(),
        config.poll_interval,
    );

    let hub = Hub::new(
        state.clone(),
        keying.clone(),
        polling.clone(),
        default_validator(config.allow_anon_dashboard),
        config.ws_heartbeat_interval,
        config.ws_tx_batch_window,
    );

    ami.start(shutdown_rx.clone()).await;
    keying.start(shutdown_rx.clone());
    hub.start(shutdown_rx.clone());

    if config.disable_link_poller {
        info!("link poller disabled by configuration");
    } else {
        polling.start(shutdown_rx.clone());
    }

    if let Some(path) = config.astdb_path.clone() {
        let importer = AstdbImporter::new(path, config.astdb_update_hours, node_info.clone());
        importer.start(shutdown_rx.clone());
    }

    spawn_ami_event_pump(ami.clone(), state.clone(), keying.clone(), shutdown_rx.clone());

    let app_state = AppState {
        state,
        link_stats,
        node_info,
        polling,
    };
    let router = build_router(app_state, hub);

    Ok((router, shutdown_tx))
}

/// Seeds persisted link totals into the state manager and keying tracker at
/// boot (spec.md §4.5), so a restart doesn't discard cumulative TX time.
async fn seed_from_persistence(state: &Arc<StateManager>, link_stats: &Arc<LinkStatsRepository>) {
    let stats = match link_stats.get_all().await {
        Ok(stats) => stats,
        Err(error) => {
            warn!(%error, "failed to load persisted link stats at boot, starting empty");
            return;
        }
    };
    if stats.is_empty() {
        return;
    }

    // `link_stats` has no source-node column (spec.md §3 LinkStat), so every
    // configured source is seeded with the full set; the first poll's
    // apply_combined_status reconciles ownership per source.
    let source_nodes: Vec<i64> = state.snapshots().into_iter().map(|s| s.node_id).collect();
    for source_node in source_nodes {
        state.seed_link_stats(source_node, stats.clone());
    }
}

/// Reads parsed AMI frames and dispatches them to both the state manager
/// and, when the frame carries adjacent-node keying data, the keying
/// tracker (spec.md §2 data flow).
fn spawn_ami_event_pump(
    ami: AmiClient,
    state: Arc<StateManager>,
    keying: Arc<KeyingTracker>,
    mut cancel: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut events = ami.raw_events();
        loop {
            tokio::select! {
                item = events.next() => {
                    match item {
                        Some(Ok(message)) => {
                            // `RPT_ALINKS` only ever arrives as an `Event`/`EventValue`
                            // pair on live AMI traffic; normalize a copy the same way
                            // `StateManager::apply` does before looking for it, so the
                            // keying tracker is actually driven by the live event
                            // stream rather than only by the 60s poll cycle.
                            let mut normalized = message.clone();
                            normalize_headers(&mut normalized);

                            if let Some(source_node) = node_header(&normalized) {
                                if let Some(payload) = normalized.get("RPT_ALINKS") {
                                    let registry = state.registry();
                                    let (_, keyed_map) = parse_alinks(payload, &registry);
                                    let observations: Vec<AdjacentObservation> = keyed_map
                                        .iter()
                                        .map(|(&node_id, &is_keyed)| AdjacentObservation {
                                            node_id,
                                            is_keyed,
                                            ..Default::default()
                                        })
                                        .collect();
                                    let tx_keyed = normalized
                                        .get("RPT_TXKEYED")
                                        .is_some_and(|v| v.trim() == "1");
                                    let rx_keyed = normalized
                                        .get("RPT_RXKEYED")
                                        .is_some_and(|v| v.trim() == "1");
                                    keying.apply_snapshot(source_node, chrono::Utc::now(), observations, tx_keyed, rx_keyed);
                                }
                            }
                            state.apply(message);
                        }
                        Some(Err(_)) => continue,
                        None => return,
                    }
                }
                _ = cancel.changed() => { if *cancel.borrow() { return; } }
            }
        }
    });
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::persistence::{LinkStatsRepository, NodeInfoRepository};
use crate::polling::PollingService;
use crate::state::StateManager;
use crate::ws::{ws_upgrade_handler, Hub};

/// Shared application state for the HTTP stand-in handlers (spec.md §6
/// HTTP REST). The core only serves these; auth and rate-limiting are
/// registered by an external collaborator wrapping this router.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<StateManager>,
    pub link_stats: Arc<LinkStatsRepository>,
    pub node_info: Arc<NodeInfoRepository>,
    pub polling: Arc<PollingService>,
}

pub fn build_router(app_state: AppState, hub: Arc<Hub>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    let ws_router = Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .with_state(hub);

    let api_router = Router::new()
        .route("/api/health", get(health))
        .route("/api/poll-now", get(poll_now))
        .route("/api/link-stats", get(link_stats))
        .route("/api/link-stats/top", get(link_stats_top))
        .route("/api/node-lookup", get(node_lookup))
        .with_state(app_state);

    Router::new()
        .merge(ws_router)
        .merge(api_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct PollNowQuery {
    node: Option<i64>,
}

async fn poll_now(State(app_state): State<AppState>, Query(query): Query<PollNowQuery>) -> impl IntoResponse {
    match query.node {
        Some(node_id) => app_state.polling.trigger_poll_node(node_id),
        None => app_state.polling.trigger_poll_once().await,
    }
    StatusCode::ACCEPTED
}

async fn link_stats(State(app_state): State<AppState>) -> impl IntoResponse {
    match app_state.link_stats.get_all().await {
        Ok(stats) => Json(json!(stats_to_json(&stats))).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TopQuery {
    limit: Option<i64>,
}

async fn link_stats_top(State(app_state): State<AppState>, Query(query): Query<TopQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    match app_state.link_stats.top(limit).await {
        Ok(stats) => Json(json!(stats_to_json(&stats))).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

fn stats_to_json(stats: &[crate::persistence::LinkStat]) -> Vec<serde_json::Value> {
    stats
        .iter()
        .map(|s| {
            json!({
                "node": s.node,
                "totalTxSeconds": s.total_tx_seconds,
                "lastTxStart": s.last_tx_start,
                "lastTxEnd": s.last_tx_end,
                "connectedSince": s.connected_since,
                "updatedAt": s.updated_at,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    q: String,
}

async fn node_lookup(State(app_state): State<AppState>, Query(query): Query<LookupQuery>) -> impl IntoResponse {
    match app_state.node_info.search(&query.q).await {
        Ok(results) => Json(results.into_iter().map(node_info_to_json).collect::<Vec<_>>()).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

fn node_info_to_json(info: crate::persistence::NodeInfo) -> serde_json::Value {
    json!({
        "nodeId": info.node_id,
        "callsign": info.callsign,
        "description": info.description,
        "location": info.location,
        "lastSeen": info.last_seen,
    })
}

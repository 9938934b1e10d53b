use std::env;
use std::time::Duration;

/// A single configured source node: an AllStarLink node id this process
/// monitors, with an optional human-readable display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: i64,
    pub display_name: Option<String>,
}

/// Top-level service configuration. Loaded from environment variables;
/// every field has a default so the process can start against a bare
/// environment for local development.
#[derive(Debug, Clone)]
pub struct Config {
    pub ami_host: String,
    pub ami_port: u16,
    pub ami_username: String,
    pub ami_password: String,
    pub ami_events: String,

    pub ami_retry_interval: Duration,
    pub ami_retry_max: Duration,

    pub nodes: Vec<NodeConfig>,

    pub disable_link_poller: bool,
    pub poll_interval: Duration,
    pub keying_delay_ms: u64,

    pub allow_anon_dashboard: bool,

    pub db_path: String,

    pub astdb_path: Option<String>,
    pub astdb_update_hours: u64,

    pub title: String,
    pub subtitle: String,

    pub ws_heartbeat_interval: Duration,
    pub ws_tx_batch_window: Duration,

    pub http_bind_addr: String,

    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ami_host: "127.0.0.1".into(),
            ami_port: 5038,
            ami_username: String::new(),
            ami_password: String::new(),
            ami_events: "on".into(),

            ami_retry_interval: Duration::from_secs(15),
            ami_retry_max: Duration::from_secs(60),

            nodes: Vec::new(),

            disable_link_poller: false,
            poll_interval: Duration::from_secs(60),
            keying_delay_ms: 2000,

            allow_anon_dashboard: false,

            db_path: "allstar-telemetry.sqlite3".into(),

            astdb_path: None,
            astdb_update_hours: 24,

            title: "AllStarLink Node".into(),
            subtitle: String::new(),

            ws_heartbeat_interval: Duration::from_secs(5),
            ws_tx_batch_window: Duration::from_millis(100),

            http_bind_addr: "0.0.0.0:8080".into(),

            log_filter: "info".into(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// `Default::default()` for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("AMI_HOST") {
            cfg.ami_host = v;
        }
        if let Ok(v) = env::var("AMI_PORT") {
            if let Ok(port) = v.parse() {
                cfg.ami_port = port;
            }
        }
        if let Ok(v) = env::var("AMI_USERNAME") {
            cfg.ami_username = v;
        }
        if let Ok(v) = env::var("AMI_PASSWORD") {
            cfg.ami_password = v;
        }
        if let Ok(v) = env::var("AMI_EVENTS") {
            cfg.ami_events = v;
        }
        if let Ok(v) = env::var("AMI_RETRY_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.ami_retry_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = env::var("AMI_RETRY_MAX_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.ami_retry_max = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = env::var("NODES") {
            cfg.nodes = parse_nodes(&v);
        }
        if let Ok(v) = env::var("DISABLE_LINK_POLLER") {
            cfg.disable_link_poller = parse_bool(&v);
        }
        if let Ok(v) = env::var("POLL_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.poll_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = env::var("KEYING_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                cfg.keying_delay_ms = ms;
            }
        }
        if let Ok(v) = env::var("ALLOW_ANON_DASHBOARD") {
            cfg.allow_anon_dashboard = parse_bool(&v);
        }
        if let Ok(v) = env::var("DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("ASTDB_PATH") {
            cfg.astdb_path = Some(v);
        }
        if let Ok(v) = env::var("ASTDB_UPDATE_HOURS") {
            if let Ok(hours) = v.parse() {
                cfg.astdb_update_hours = hours;
            }
        }
        if let Ok(v) = env::var("NODE_TITLE") {
            cfg.title = v;
        }
        if let Ok(v) = env::var("NODE_SUBTITLE") {
            cfg.subtitle = v;
        }
        if let Ok(v) = env::var("HTTP_BIND_ADDR") {
            cfg.http_bind_addr = v;
        }
        if let Ok(v) = env::var("RUST_LOG") {
            cfg.log_filter = v;
        }

        cfg
    }
}

/// Parses a `NODES` value of the form `594950:Main,28800` — comma
/// separated node ids, each optionally suffixed with `:Display Name`.
fn parse_nodes(raw: &str) -> Vec<NodeConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.splitn(2, ':');
            let id_part = parts.next()?.trim();
            let node_id: i64 = id_part.parse().ok()?;
            let display_name = parts.next().map(|s| s.trim().to_string());
            Some(NodeConfig {
                node_id,
                display_name,
            })
        })
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nodes_with_and_without_display_names() {
        let nodes = parse_nodes("594950:Main Repeater, 28800 ,  617849:Backup ");
        assert_eq!(
            nodes,
            vec![
                NodeConfig {
                    node_id: 594950,
                    display_name: Some("Main Repeater".into())
                },
                NodeConfig {
                    node_id: 28800,
                    display_name: None
                },
                NodeConfig {
                    node_id: 617849,
                    display_name: Some("Backup".into())
                },
            ]
        );
    }

    #[test]
    fn parses_bool_variants() {
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("no"));
        assert!(!parse_bool(""));
    }
}

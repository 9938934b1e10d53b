use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection direction for a link, as reported by XStat.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Unknown => "",
        }
    }
}

/// Link mode as encoded in `LinkedNodes: Txxx,Rxxx,Cxxx,Mxxx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    Transceive,
    Receive,
    Connecting,
    Monitor,
    #[serde(rename = "")]
    Unknown,
}

impl LinkMode {
    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'T' => Some(LinkMode::Transceive),
            'R' => Some(LinkMode::Receive),
            'C' => Some(LinkMode::Connecting),
            'M' => Some(LinkMode::Monitor),
            _ => None,
        }
    }
}

/// The edge a TX-state transition crossed, returned by `LinkInfo::update_tx`
/// so callers can emit the matching event without recomputing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxEdge {
    Started,
    Ended { duration_seconds: i64 },
}

/// One connected remote node, keyed by `(local_node, remote_node)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub node: i64,
    pub local_node: i64,
    pub node_callsign: String,
    pub node_description: String,
    pub node_location: String,

    pub connected_since: DateTime<Utc>,
    pub ip: String,
    pub direction: Direction,
    pub elapsed: String,
    pub link_type: String,
    pub mode: Option<LinkMode>,

    pub current_tx: bool,
    pub is_keyed: bool,
    pub last_tx_start: Option<DateTime<Utc>>,
    pub last_tx_end: Option<DateTime<Utc>>,
    pub last_heard_at: Option<DateTime<Utc>>,
    pub last_keyed_time: Option<DateTime<Utc>>,
    pub secs_since_keyed: Option<i64>,
    pub total_tx_seconds: i64,
}

impl LinkInfo {
    pub fn new(node: i64, local_node: i64, connected_since: DateTime<Utc>) -> Self {
        LinkInfo {
            node,
            local_node,
            node_callsign: String::new(),
            node_description: String::new(),
            node_location: String::new(),
            connected_since,
            ip: String::new(),
            direction: Direction::Unknown,
            elapsed: String::new(),
            link_type: String::new(),
            mode: None,
            current_tx: false,
            is_keyed: false,
            last_tx_start: None,
            last_tx_end: None,
            last_heard_at: None,
            last_keyed_time: None,
            secs_since_keyed: None,
            total_tx_seconds: 0,
        }
    }

    /// Applies a new keyed observation, mutating TX bookkeeping and
    /// returning the edge crossed, if any (spec.md §3 LinkInfo invariants).
    pub fn update_tx(&mut self, keyed: bool, now: DateTime<Utc>) -> Option<TxEdge> {
        self.is_keyed = keyed;
        self.last_heard_at = Some(now);

        if keyed == self.current_tx {
            return None;
        }

        self.current_tx = keyed;
        if keyed {
            self.last_tx_start = Some(now);
            Some(TxEdge::Started)
        } else {
            self.last_tx_end = Some(now);
            let duration = match self.last_tx_start {
                Some(start) => (now - start).num_seconds().max(0),
                None => 0,
            };
            self.total_tx_seconds += duration;
            Some(TxEdge::Ended {
                duration_seconds: duration,
            })
        }
    }
}

/// The authoritative, process-wide snapshot of a source node's topology and
/// keying state. One per configured source node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: i64,
    pub rx_keyed: bool,
    pub tx_keyed: bool,

    pub links: Vec<i64>,
    pub links_detailed: Vec<LinkInfo>,

    pub num_links: i64,
    pub num_alinks: i64,

    pub booted_at: Option<DateTime<Utc>>,
    pub uptime_sec: i64,
    pub last_reload_sec: i64,

    pub build_time: String,
    pub version: String,
    pub title: String,
    pub subtitle: String,

    pub heartbeat: i64,
    pub session_start: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeState {
    pub fn new(node_id: i64, title: String, subtitle: String) -> Self {
        let now = Utc::now();
        NodeState {
            node_id,
            rx_keyed: false,
            tx_keyed: false,
            links: Vec::new(),
            links_detailed: Vec::new(),
            num_links: 0,
            num_alinks: 0,
            booted_at: None,
            uptime_sec: 0,
            last_reload_sec: 0,
            build_time: String::new(),
            version: String::new(),
            title,
            subtitle,
            heartbeat: 0,
            session_start: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_tx_rising_edge_sets_last_tx_start() {
        let since = Utc::now();
        let mut link = LinkInfo::new(634021, 594950, since);
        let now = since + chrono::Duration::seconds(1);
        let edge = link.update_tx(true, now);
        assert_eq!(edge, Some(TxEdge::Started));
        assert_eq!(link.last_tx_start, Some(now));
        assert!(link.current_tx);
    }

    #[test]
    fn update_tx_falling_edge_accumulates_total() {
        let since = Utc::now();
        let mut link = LinkInfo::new(634021, 594950, since);
        let start = since + chrono::Duration::seconds(1);
        link.update_tx(true, start);
        let end = start + chrono::Duration::seconds(3);
        let edge = link.update_tx(false, end);
        assert_eq!(edge, Some(TxEdge::Ended { duration_seconds: 3 }));
        assert_eq!(link.total_tx_seconds, 3);
        assert!(!link.current_tx);
    }

    #[test]
    fn update_tx_same_state_is_not_an_edge() {
        let since = Utc::now();
        let mut link = LinkInfo::new(634021, 594950, since);
        assert_eq!(link.update_tx(false, since), None);
    }
}

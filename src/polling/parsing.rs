use std::collections::HashMap;

use crate::state::{Direction, LinkMode, SawStatEntry, XStatConnection};

/// Parses an XStat command response body into connections plus the local
/// node's own RX/TX keyed flags (spec.md §4.4).
pub fn parse_xstat(raw_lines: &[String]) -> (Vec<XStatConnection>, Option<bool>, Option<bool>) {
    let mut connections = Vec::new();
    let mut modes: HashMap<i64, LinkMode> = HashMap::new();
    let mut rx_keyed = None;
    let mut tx_keyed = None;

    for line in raw_lines {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Conn:") {
            if let Some(conn) = parse_conn_line(rest.trim()) {
                connections.push(conn);
            }
        } else if let Some(rest) = line.strip_prefix("LinkedNodes:") {
            parse_linked_nodes(rest.trim(), &mut modes);
        } else if let Some(rest) = line.strip_prefix("Var: RPT_RXKEYED=") {
            rx_keyed = Some(rest.trim() == "1");
        } else if let Some(rest) = line.strip_prefix("Var: RPT_TXKEYED=") {
            tx_keyed = Some(rest.trim() == "1");
        }
    }

    for conn in &mut connections {
        conn.mode = modes.get(&conn.node).copied();
    }

    (connections, rx_keyed, tx_keyed)
}

fn parse_linked_nodes(payload: &str, modes: &mut HashMap<i64, LinkMode>) {
    for token in payload.split(',') {
        let token = token.trim();
        let mut chars = token.chars();
        let Some(prefix) = chars.next() else { continue };
        let Some(mode) = LinkMode::from_prefix(prefix) else { continue };
        if let Ok(node) = chars.as_str().parse::<i64>() {
            modes.insert(node, mode);
        }
    }
}

fn parse_conn_line(rest: &str) -> Option<XStatConnection> {
    let mut fields = rest.split_whitespace();
    let node = fields.next()?.parse::<i64>().ok()?;
    let ip_raw = fields.next()?;
    let ip = if ip_raw == "(no-ip)" { String::new() } else { ip_raw.to_string() };
    let is_keyed = fields.next()? == "1";
    let direction = match fields.next()? {
        "IN" => Direction::In,
        "OUT" => Direction::Out,
        _ => Direction::Unknown,
    };
    let elapsed = fields.next().unwrap_or("").to_string();
    let link_type = fields.next().unwrap_or("").to_string();

    Some(XStatConnection {
        node,
        ip,
        is_keyed,
        direction,
        elapsed,
        link_type,
        mode: None,
        node_callsign: String::new(),
        node_description: String::new(),
        node_location: String::new(),
    })
}

/// Parses a SawStat command response body (spec.md §4.4).
pub fn parse_sawstat(raw_lines: &[String]) -> Vec<SawStatEntry> {
    raw_lines
        .iter()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Conn:")?;
            let mut fields = rest.trim().split_whitespace();
            let node = fields.next()?.parse::<i64>().ok()?;
            let _is_keyed = fields.next()?;
            let secs_since_keyed = fields.next()?.parse::<i64>().ok()?;
            Some(SawStatEntry { node, secs_since_keyed })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xstat_connections_and_local_keyed_vars() {
        let raw_lines = vec![
            "Conn: 634021 192.168.1.5 1 OUT 00:12:34 ESTABLISHED".to_string(),
            "Conn: 590110 (no-ip) 0 IN 00:00:05 ESTABLISHED".to_string(),
            "LinkedNodes: T634021,R590110".to_string(),
            "Var: RPT_RXKEYED=1".to_string(),
            "Var: RPT_TXKEYED=0".to_string(),
        ];

        let (connections, rx_keyed, tx_keyed) = parse_xstat(&raw_lines);
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].node, 634021);
        assert!(connections[0].is_keyed);
        assert_eq!(connections[0].mode, Some(LinkMode::Transceive));
        assert_eq!(connections[1].ip, "");
        assert_eq!(connections[1].mode, Some(LinkMode::Receive));
        assert_eq!(rx_keyed, Some(true));
        assert_eq!(tx_keyed, Some(false));
    }

    #[test]
    fn parses_sawstat_secs_since_keyed() {
        let raw_lines = vec!["Conn: 634021 1 12 0".to_string()];
        let entries = parse_sawstat(&raw_lines);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node, 634021);
        assert_eq!(entries[0].secs_since_keyed, 12);
    }
}

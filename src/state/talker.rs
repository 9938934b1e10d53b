use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const RING_BUFFER_CAPACITY: usize = 200;
const TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TalkerKind {
    TxStart,
    TxStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalkerEvent {
    pub at: DateTime<Utc>,
    pub kind: TalkerKind,
    pub node: i64,
    pub callsign: String,
    pub duration_s: Option<i64>,
}

/// Tracks the last emitted talker-log edge per node, and the deduplicated
/// ring buffer itself. Dedup is applied before append (spec.md §4.2) so a
/// reconnecting client's snapshot never shows two adjacent entries for the
/// same `(node, kind)`.
#[derive(Debug, Default)]
pub struct TalkerLog {
    last_state: HashMap<i64, TalkerKind>,
    ring: VecDeque<TalkerEvent>,
}

impl TalkerLog {
    pub fn new() -> Self {
        TalkerLog::default()
    }

    /// Attempts to record a TX edge for `node`. Returns the event if it was
    /// appended, `None` if deduplicated against the last known state for
    /// that node.
    pub fn try_record(
        &mut self,
        node: i64,
        kind: TalkerKind,
        at: DateTime<Utc>,
        callsign: String,
        duration_s: Option<i64>,
    ) -> Option<TalkerEvent> {
        if self.last_state.get(&node) == Some(&kind) {
            return None;
        }
        self.last_state.insert(node, kind);

        let event = TalkerEvent {
            at,
            kind,
            node,
            callsign,
            duration_s,
        };

        self.prune(at);
        if self.ring.len() >= RING_BUFFER_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(event.clone());
        Some(event)
    }

    /// A TTL- and capacity-bounded snapshot, oldest first.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Vec<TalkerEvent> {
        self.prune(now);
        self.ring.iter().cloned().collect()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::minutes(TTL_MINUTES);
        while let Some(front) = self.ring.front() {
            if front.at < cutoff {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_same_kind_is_deduplicated() {
        let mut log = TalkerLog::new();
        let t0 = Utc::now();
        let first = log.try_record(42, TalkerKind::TxStart, t0, "W1AW".into(), None);
        assert!(first.is_some());

        let second = log.try_record(42, TalkerKind::TxStart, t0 + ChronoDuration::seconds(1), "W1AW".into(), None);
        assert!(second.is_none());

        assert_eq!(log.snapshot(t0 + ChronoDuration::seconds(2)).len(), 1);
    }

    #[test]
    fn alternating_kinds_both_recorded() {
        let mut log = TalkerLog::new();
        let t0 = Utc::now();
        log.try_record(42, TalkerKind::TxStart, t0, "W1AW".into(), None);
        log.try_record(
            42,
            TalkerKind::TxStop,
            t0 + ChronoDuration::seconds(3),
            "W1AW".into(),
            Some(3),
        );
        assert_eq!(log.snapshot(t0 + ChronoDuration::seconds(4)).len(), 2);
    }

    #[test]
    fn entries_older_than_ttl_are_pruned() {
        let mut log = TalkerLog::new();
        let t0 = Utc::now();
        log.try_record(42, TalkerKind::TxStart, t0, "W1AW".into(), None);
        let later = t0 + ChronoDuration::minutes(11);
        assert!(log.snapshot(later).is_empty());
    }
}

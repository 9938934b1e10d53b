use chrono::{DateTime, Utc};
use libsql::params;
use tracing::instrument;

use crate::errors::PersistenceError;
use crate::state::LinkInfo;

use super::PersistenceClient;

/// A persisted row in `link_stats` (spec.md §3 LinkStat).
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStat {
    pub node: i64,
    pub total_tx_seconds: i64,
    pub last_tx_start: Option<DateTime<Utc>>,
    pub last_tx_end: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&LinkInfo> for LinkStat {
    fn from(link: &LinkInfo) -> Self {
        LinkStat {
            node: link.node,
            total_tx_seconds: link.total_tx_seconds,
            last_tx_start: link.last_tx_start,
            last_tx_end: link.last_tx_end,
            connected_since: Some(link.connected_since),
            updated_at: Utc::now(),
        }
    }
}

fn to_rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|v| v.to_rfc3339())
}

fn from_rfc3339(value: Option<String>) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| PersistenceError::Decode(format!("bad timestamp {raw:?}: {e}"))),
    }
}

pub struct LinkStatsRepository {
    client: PersistenceClient,
}

impl LinkStatsRepository {
    pub fn new(client: PersistenceClient) -> Self {
        LinkStatsRepository { client }
    }

    #[instrument(skip(self))]
    pub async fn get_all(&self) -> Result<Vec<LinkStat>, PersistenceError> {
        let conn = self.client.connection()?;
        let mut rows = conn
            .query(
                "SELECT node, total_tx_seconds, last_tx_start, last_tx_end, connected_since, updated_at \
                 FROM link_stats ORDER BY node",
                (),
            )
            .await?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next().await? {
            let updated_at: String = row.get(5)?;
            stats.push(LinkStat {
                node: row.get(0)?,
                total_tx_seconds: row.get(1)?,
                last_tx_start: from_rfc3339(row.get(2)?)?,
                last_tx_end: from_rfc3339(row.get(3)?)?,
                connected_since: from_rfc3339(row.get(4)?)?,
                updated_at: from_rfc3339(Some(updated_at))?.unwrap_or_else(Utc::now),
            });
        }
        Ok(stats)
    }

    /// Transactional upsert of a batch of links (spec.md §4.5: insert-or-
    /// update-on-conflict on `node` in a single statement per row).
    #[instrument(skip(self, links))]
    pub async fn upsert_batch(&self, links: &[LinkInfo]) -> Result<(), PersistenceError> {
        if links.is_empty() {
            return Ok(());
        }
        let conn = self.client.connection()?;
        let tx = conn.transaction().await?;
        for link in links {
            let stat = LinkStat::from(link);
            tx.execute(
                "INSERT INTO link_stats (node, total_tx_seconds, last_tx_start, last_tx_end, connected_since, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(node) DO UPDATE SET \
                     total_tx_seconds = excluded.total_tx_seconds, \
                     last_tx_start = excluded.last_tx_start, \
                     last_tx_end = excluded.last_tx_end, \
                     connected_since = excluded.connected_since, \
                     updated_at = excluded.updated_at",
                params![
                    stat.node,
                    stat.total_tx_seconds,
                    to_rfc3339(stat.last_tx_start),
                    to_rfc3339(stat.last_tx_end),
                    to_rfc3339(stat.connected_since),
                    stat.updated_at.to_rfc3339(),
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Top talkers by cumulative TX seconds, for the external stats API.
    #[instrument(skip(self))]
    pub async fn top(&self, limit: i64) -> Result<Vec<LinkStat>, PersistenceError> {
        let conn = self.client.connection()?;
        let mut rows = conn
            .query(
                "SELECT node, total_tx_seconds, last_tx_start, last_tx_end, connected_since, updated_at \
                 FROM link_stats ORDER BY total_tx_seconds DESC LIMIT ?1",
                params![limit],
            )
            .await?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next().await? {
            let updated_at: String = row.get(5)?;
            stats.push(LinkStat {
                node: row.get(0)?,
                total_tx_seconds: row.get(1)?,
                last_tx_start: from_rfc3339(row.get(2)?)?,
                last_tx_end: from_rfc3339(row.get(3)?)?,
                connected_since: from_rfc3339(row.get(4)?)?,
                updated_at: from_rfc3339(Some(updated_at))?.unwrap_or_else(Utc::now),
            });
        }
        Ok(stats)
    }

    /// Deletes rows whose node id is not in `active_ids`, returning the
    /// count removed. Used by the polling cleanup callback.
    #[instrument(skip(self, active_ids))]
    pub async fn delete_not_in(&self, active_ids: &[i64]) -> Result<u64, PersistenceError> {
        let conn = self.client.connection()?;
        if active_ids.is_empty() {
            let deleted = conn.execute("DELETE FROM link_stats", ()).await?;
            return Ok(deleted);
        }
        let placeholders = active_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("DELETE FROM link_stats WHERE node NOT IN ({placeholders})");
        let deleted = conn.execute(&sql, ()).await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repository() -> LinkStatsRepository {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = format!("file:link_stats_test_{id}?mode=memory&cache=shared");
        let client = PersistenceClient::open(&path).await.unwrap();
        LinkStatsRepository::new(client)
    }

    #[tokio::test]
    async fn upsert_then_get_all_round_trips() {
        let repo = repository().await;
        let link = LinkInfo::new(634021, 594950, Utc::now());
        repo.upsert_batch(&[link]).await.unwrap();

        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].node, 634021);
    }

    #[tokio::test]
    async fn delete_not_in_prunes_stale_rows() {
        let repo = repository().await;
        let a = LinkInfo::new(100, 594950, Utc::now());
        let b = LinkInfo::new(200, 594950, Utc::now());
        repo.upsert_batch(&[a, b]).await.unwrap();

        let deleted = repo.delete_not_in(&[100]).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = repo.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node, 100);
    }
}

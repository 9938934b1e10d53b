use chrono::{DateTime, Duration, Utc};
use libsql::params;
use tracing::instrument;

use crate::errors::PersistenceError;

use super::PersistenceClient;

/// A persisted row in `node_info` (spec.md §3 NodeInfo).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub node_id: i64,
    pub callsign: String,
    pub description: String,
    pub location: String,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One `node_id|callsign|description|location` record from the astdb feed,
/// prior to timestamping.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoUpsert {
    pub node_id: i64,
    pub callsign: String,
    pub description: String,
    pub location: String,
}

fn row_to_node_info(row: &libsql::Row) -> Result<NodeInfo, PersistenceError> {
    let parse = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PersistenceError::Decode(format!("bad timestamp {raw:?}: {e}")))
    };
    Ok(NodeInfo {
        node_id: row.get(0)?,
        callsign: row.get(1)?,
        description: row.get(2)?,
        location: row.get(3)?,
        last_seen: parse(row.get(4)?)?,
        created_at: parse(row.get(5)?)?,
        updated_at: parse(row.get(6)?)?,
    })
}

const SELECT_COLUMNS: &str =
    "node_id, callsign, description, location, last_seen, created_at, updated_at";

pub struct NodeInfoRepository {
    client: PersistenceClient,
}

impl NodeInfoRepository {
    pub fn new(client: PersistenceClient) -> Self {
        NodeInfoRepository { client }
    }

    /// Used on every enrichment lookup; bounded to 1s per spec.md §4.5.
    #[instrument(skip(self))]
    pub async fn get_by_node_id(&self, node_id: i64) -> Result<Option<NodeInfo>, PersistenceError> {
        let conn = self.client.connection()?;
        let query = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            conn.query(
                &format!("SELECT {SELECT_COLUMNS} FROM node_info WHERE node_id = ?1"),
                params![node_id],
            ),
        )
        .await
        .map_err(|_| PersistenceError::Decode("node_info lookup timed out".into()))??;

        let mut rows = query;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_node_info(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_callsign(&self, callsign: &str) -> Result<Vec<NodeInfo>, PersistenceError> {
        let conn = self.client.connection()?;
        let mut rows = conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM node_info WHERE callsign = ?1"),
                params![callsign.to_ascii_uppercase()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_node_info(&row)?);
        }
        Ok(out)
    }

    pub async fn get_by_location_prefix(&self, prefix: &str) -> Result<Vec<NodeInfo>, PersistenceError> {
        let conn = self.client.connection()?;
        let pattern = format!("{prefix}%");
        let mut rows = conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM node_info WHERE location LIKE ?1"),
                params![pattern],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_node_info(&row)?);
        }
        Ok(out)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<NodeInfo>, PersistenceError> {
        let conn = self.client.connection()?;
        let pattern = format!("%{query}%");
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM node_info \
                     WHERE callsign LIKE ?1 OR description LIKE ?1 OR location LIKE ?1 \
                     ORDER BY node_id LIMIT 50"
                ),
                params![pattern],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_node_info(&row)?);
        }
        Ok(out)
    }

    /// Bulk-upserts `records` in batches of 1000 rows per transaction,
    /// stamping `last_seen = now()` for every row seen (spec.md §4.5).
    #[instrument(skip(self, records))]
    pub async fn bulk_upsert(&self, records: &[NodeInfoUpsert]) -> Result<(), PersistenceError> {
        let conn = self.client.connection()?;
        let now = Utc::now().to_rfc3339();

        for chunk in records.chunks(1000) {
            let tx = conn.transaction().await?;
            for record in chunk {
                tx.execute(
                    "INSERT INTO node_info (node_id, callsign, description, location, last_seen, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5) \
                     ON CONFLICT(node_id) DO UPDATE SET \
                         callsign = excluded.callsign, \
                         description = excluded.description, \
                         location = excluded.location, \
                         last_seen = excluded.last_seen, \
                         updated_at = excluded.updated_at",
                    params![
                        record.node_id,
                        record.callsign.clone(),
                        record.description.clone(),
                        record.location.clone(),
                        now.clone(),
                    ],
                )
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Run after each astdb import to drop records that dropped out of the
    /// feed (spec.md §6: "records older than 7 days are deleted").
    #[instrument(skip(self))]
    pub async fn delete_stale_nodes(&self, older_than: Duration) -> Result<u64, PersistenceError> {
        let conn = self.client.connection()?;
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let deleted = conn
            .execute(
                "DELETE FROM node_info WHERE last_seen < ?1",
                params![cutoff],
            )
            .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repository() -> NodeInfoRepository {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = format!("file:node_info_test_{id}?mode=memory&cache=shared");
        let client = PersistenceClient::open(&path).await.unwrap();
        NodeInfoRepository::new(client)
    }

    #[tokio::test]
    async fn bulk_upsert_then_lookup_by_node_id() {
        let repo = repository().await;
        repo.bulk_upsert(&[NodeInfoUpsert {
            node_id: 594950,
            callsign: "W1AW".into(),
            description: "Test node".into(),
            location: "Newington, CT".into(),
        }])
        .await
        .unwrap();

        let found = repo.get_by_node_id(594950).await.unwrap().unwrap();
        assert_eq!(found.callsign, "W1AW");
    }

    #[tokio::test]
    async fn delete_stale_nodes_prunes_old_last_seen() {
        let repo = repository().await;
        let conn = repo.client.connection().unwrap();
        let old = (Utc::now() - Duration::days(10)).to_rfc3339();
        conn.execute(
            "INSERT INTO node_info (node_id, callsign, description, location, last_seen, created_at, updated_at) \
             VALUES (1, 'OLD', '', '', ?1, ?1, ?1)",
            params![old],
        )
        .await
        .unwrap();

        let deleted = repo.delete_stale_nodes(Duration::days(7)).await.unwrap();
        assert_eq!(deleted, 1);
    }
}

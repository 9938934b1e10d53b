use libsql::Connection;
use tracing::instrument;

use crate::errors::PersistenceError;

const TABLES: &[(&str, &str)] = &[
    (
        "link_stats",
        r#"
        CREATE TABLE IF NOT EXISTS link_stats (
            node INTEGER PRIMARY KEY,
            total_tx_seconds INTEGER NOT NULL DEFAULT 0,
            last_tx_start TEXT,
            last_tx_end TEXT,
            connected_since TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "node_info",
        r#"
        CREATE TABLE IF NOT EXISTS node_info (
            node_id INTEGER PRIMARY KEY,
            callsign TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            location TEXT NOT NULL DEFAULT '',
            last_seen TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "node_info_callsign_idx",
        "CREATE INDEX IF NOT EXISTS node_info_callsign_idx ON node_info(callsign)",
    ),
    (
        "node_info_location_idx",
        "CREATE INDEX IF NOT EXISTS node_info_location_idx ON node_info(location)",
    ),
    (
        "node_info_last_seen_idx",
        "CREATE INDEX IF NOT EXISTS node_info_last_seen_idx ON node_info(last_seen)",
    ),
];

// The users/transmission-log/gamification tables owned by external
// collaborators (spec §6) coexist in the same file but are not created or
// migrated here.

#[instrument(skip(conn))]
pub async fn apply(conn: &Connection) -> Result<(), PersistenceError> {
    conn.query("PRAGMA journal_mode=WAL", ()).await?;
    for (name, statement) in TABLES {
        conn.execute(statement, ()).await.map_err(|source| {
            tracing::error!(table = *name, %source, "schema migration failed");
            PersistenceError::Query(source)
        })?;
    }
    Ok(())
}

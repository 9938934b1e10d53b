use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::persistence::{NodeInfoRepository, NodeInfoUpsert};

const STALE_AFTER_DAYS: i64 = 7;

/// Periodically re-reads the node-identity feed at `path` and reconciles it
/// into `node_info` (spec.md §6 node-info source). The feed file itself is
/// refreshed by an external downloader; this importer only consumes it.
pub struct AstdbImporter {
    path: String,
    interval: Duration,
    node_info: Arc<NodeInfoRepository>,
}

impl AstdbImporter {
    pub fn new(path: String, update_hours: u64, node_info: Arc<NodeInfoRepository>) -> Arc<Self> {
        Arc::new(AstdbImporter {
            path,
            interval: Duration::from_secs(update_hours.max(1) * 3600),
            node_info,
        })
    }

    pub fn start(self: &Arc<Self>, cancel: watch::Receiver<bool>) {
        let importer = self.clone();
        tokio::spawn(async move { importer.run(cancel).await });
    }

    async fn run(&self, mut cancel: watch::Receiver<bool>) {
        if let Err(error) = self.import_once().await {
            warn!(%error, path = %self.path, "initial astdb import failed");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.import_once().await {
                        warn!(%error, path = %self.path, "astdb import failed");
                    }
                }
                _ = cancel.changed() => { if *cancel.borrow() { return; } }
            }
        }
    }

    #[instrument(skip(self))]
    async fn import_once(&self) -> Result<(), std::io::Error> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let records = parse_astdb(&contents);
        let count = records.len();

        if let Err(error) = self.node_info.bulk_upsert(&records).await {
            warn!(%error, "failed to upsert astdb records");
            return Ok(());
        }

        match self
            .node_info
            .delete_stale_nodes(ChronoDuration::days(STALE_AFTER_DAYS))
            .await
        {
            Ok(deleted) => info!(count, deleted, "astdb import complete"),
            Err(error) => warn!(%error, "failed to prune stale node_info rows"),
        }

        Ok(())
    }
}

/// Parses `node_id|callsign|description|location` lines, skipping any line
/// that doesn't fit the shape (spec.md §6).
fn parse_astdb(contents: &str) -> Vec<NodeInfoUpsert> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut fields = line.splitn(4, '|');
            let node_id: i64 = fields.next()?.trim().parse().ok()?;
            let callsign = fields.next().unwrap_or("").trim().to_string();
            let description = fields.next().unwrap_or("").trim().to_string();
            let location = fields.next().unwrap_or("").trim().to_string();
            Some(NodeInfoUpsert {
                node_id,
                callsign,
                description,
                location,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines_and_skips_malformed_ones() {
        let contents = "594950|W1AW|Main Repeater|Newington, CT\n\nnot-a-line\n28800|N0CALL||Unknown\n";
        let records = parse_astdb(contents);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].node_id, 594950);
        assert_eq!(records[0].callsign, "W1AW");
        assert_eq!(records[1].node_id, 28800);
        assert_eq!(records[1].description, "");
    }
}

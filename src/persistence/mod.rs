mod client;
mod link_stats;
mod node_info;
mod schema;

pub use client::PersistenceClient;
pub use link_stats::{LinkStat, LinkStatsRepository};
pub use node_info::{NodeInfo, NodeInfoUpsert, NodeInfoRepository};

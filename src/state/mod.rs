pub mod manager;
pub mod node;
pub mod registry;
pub mod talker;

pub use manager::{
    node_header, parse_alinks, parse_node_list, CombinedStatusResult, PersistenceHook,
    SawStatEntry, StateManager, TxEvent, XStatConnection,
};
pub use node::{Direction, LinkInfo, LinkMode, NodeState, TxEdge};
pub use registry::TextNodeRegistry;
pub use talker::{TalkerEvent, TalkerKind, TalkerLog};

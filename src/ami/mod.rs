pub mod client;
pub mod protocol;

pub use client::{ActionContext, AmiClient, ConnectionStatus};
pub use protocol::Message;

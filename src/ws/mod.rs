mod hub;
mod messages;

pub use hub::{default_validator, ws_upgrade_handler, Hub, Validator};
pub use messages::{envelope, MessageType};

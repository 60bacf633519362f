// docsync-common: shared types and wire protocol for the docsync relay

pub mod key;
pub mod protocol;
pub mod types;

pub use key::{DocumentKey, KeyError};
pub use protocol::channel::ChannelMessage;
pub use types::{Author, Revision};

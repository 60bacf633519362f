// docsync-relay: converges concurrent CRDT edits in a shared cache and
// persists them to the durable store in the background.

pub mod access;
pub mod broadcast;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod flush;
pub mod lock;
pub mod registry;
pub mod session;
pub mod staleness;
pub mod store;
pub mod sweep;
pub mod ws;

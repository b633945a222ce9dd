//! linevault - a key-value server speaking a colon-separated line protocol
//!
//! Many clients hold persistent TCP connections and send commands such as
//! `Put:key:value` or `Get:key`. A single coordinator task serializes every
//! command against the store, while each connection runs its own reader and
//! writer pumps:
//! - Lock-free: shared state is owned by the coordinator and reached by messages
//! - Bounded per-client memory: slow readers lose responses instead of stalling others
//! - Optional write-ahead log for the bundled in-memory store

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod wal;

pub use client::Client;
pub use config::ServerConfig;
pub use coordinator::ServerStats;
pub use error::{Error, Result};
pub use protocol::Command;
pub use server::KeyValueServer;
pub use store::{MemoryStore, Store};
pub use wal::WriteAheadLog;

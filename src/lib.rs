//! Real-time poll synchronization engine: accepts votes, keeps per-option
//! tallies consistent under concurrent writers, and fans incremental updates
//! out to every subscriber of a poll over WebSocket.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod rooms;
pub mod store;
pub mod tasks;

pub use config::Config;
pub use engine::{Engine, VoteReceipt};
pub use error::VoteError;
pub use events::{EngineEvent, EngineStats};

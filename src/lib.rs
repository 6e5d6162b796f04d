//! chat-relay: a multi-client text chat relay
//!
//! Clients connect over TCP and send text; the relay fans every message out
//! to all other connected clients, prefixed with the sender's identity.
//!
//! Features:
//! - Concurrent sessions multiplexed on a fixed-size worker pool
//! - Best-effort fan-out that tolerates slow or vanished recipients
//! - `quit` sentinel to leave the room
//! - Configuration via CLI arguments or TOML file

pub mod broadcast;
pub mod client;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;

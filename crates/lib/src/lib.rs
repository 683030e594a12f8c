//! Fanout core library — connection registry, broadcast gateway, WebSocket transport,
//! and the host server used by the CLI.

pub mod config;
pub mod gateway;

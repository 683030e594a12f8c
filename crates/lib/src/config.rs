//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.fanout/config.json`) and environment.
//! Every field has a default, so `{}` is a complete config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Host HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// WebSocket transport settings (handed to the transport, opaque to the gateway).
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Bind, port, and emit auth for the host HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 15280).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Bearer token required by `POST /emit`. Overridden by FANOUT_EMIT_TOKEN env.
    #[serde(default)]
    pub emit_token: Option<String>,
}

fn default_server_port() -> u16 {
    15280
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
            emit_token: None,
        }
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Upgrade route below the gateway prefix (default "/websocket", i.e. `/cb/websocket`).
    #[serde(default = "default_transport_path")]
    pub path: String,

    /// Frames queued per connection before writes start failing (default 64).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Largest inbound frame accepted from a client, in bytes (default 64 KiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_transport_path() -> String {
    "/websocket".to_string()
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_max_message_size() -> usize {
    64 * 1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            path: default_transport_path(),
            outbound_buffer: default_outbound_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl TransportConfig {
    /// Reject settings the transport cannot serve with.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') || self.path.len() < 2 {
            anyhow::bail!(
                "transport.path must start with '/' and name a route (got {:?})",
                self.path
            );
        }
        // Segments axum would read as captures or wildcards, or reject outright.
        let literal = self.path[1..].split('/').all(|seg| {
            !seg.is_empty()
                && !seg.starts_with(':')
                && !seg.starts_with('*')
                && !seg.contains(|c| c == '{' || c == '}')
        });
        if !literal {
            anyhow::bail!(
                "transport.path must be a literal route (got {:?})",
                self.path
            );
        }
        if self.outbound_buffer == 0 {
            anyhow::bail!("transport.outboundBuffer must be greater than zero");
        }
        if self.max_message_size == 0 {
            anyhow::bail!("transport.maxMessageSize must be greater than zero");
        }
        Ok(())
    }
}

/// Resolve the emit token: env FANOUT_EMIT_TOKEN overrides config.
pub fn resolve_emit_token(config: &Config) -> Option<String> {
    std::env::var("FANOUT_EMIT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .server
                .emit_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("FANOUT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".fanout").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, else the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

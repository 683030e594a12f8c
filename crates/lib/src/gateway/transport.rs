//! Transport seam: the gateway only needs a server it can subscribe to and mount.

use super::connection::SharedConnection;
use axum::Router;
use std::sync::Arc;

/// Route prefix every transport is mounted under.
pub const ROUTE_PREFIX: &str = "/cb";

/// Called by the transport once per accepted connection.
pub type ConnectionHandler = Arc<dyn Fn(SharedConnection) + Send + Sync>;

/// Options for `TransportServer::install_handlers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    pub prefix: String,
}

impl HandlerOptions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// A constructed transport server: emits accepted connections and mounts onto HTTP.
pub trait TransportServer: Send {
    fn on_connection(&mut self, handler: ConnectionHandler);

    /// Mount the transport's request handlers under `options.prefix` and return the router.
    fn install_handlers(&self, router: Router, options: &HandlerOptions) -> Router;
}

/// Builds transport servers from a transport-owned config.
///
/// The gateway never inspects `Config`; validation errors come back from `create_server`.
pub trait ServerFactory: Send + Sync {
    type Config;
    type Server: TransportServer;

    fn create_server(&self, config: Self::Config) -> anyhow::Result<Self::Server>;
}

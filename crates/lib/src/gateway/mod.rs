//! Gateway: connection registry and broadcast fan-out over a pluggable transport.
//!
//! The transport hands over accepted connections; the registry tracks them until they
//! close; `BroadcastGateway` wraps every outbound event as `{ eventName, data }` and
//! writes it to each one. `ws` is the axum WebSocket transport, `server` the host process.

mod broadcast;
mod connection;
mod protocol;
mod registry;
mod server;
mod transport;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use broadcast::{BroadcastGateway, GatewayError, GatewayState};
pub use connection::{
    CloseCallback, CloseSignal, Connection, ConnectionError, MessageCallback, SharedConnection,
};
pub use protocol::{BroadcastReport, Envelope, GatewayEvent};
pub use registry::{ConnectionRegistry, WeakRegistry};
pub use server::{run_server, run_server_with_shutdown};
pub use transport::{
    ConnectionHandler, HandlerOptions, ServerFactory, TransportServer, ROUTE_PREFIX,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ignoring poisoning; every critical section leaves the data consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

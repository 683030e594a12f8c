//! Broadcast gateway: transport lifecycle plus fan-out to every tracked connection.

use super::connection::SharedConnection;
use super::lock;
use super::protocol::{BroadcastReport, Envelope, GatewayEvent};
use super::registry::ConnectionRegistry;
use super::transport::{
    ConnectionHandler, HandlerOptions, ServerFactory, TransportServer, ROUTE_PREFIX,
};
use axum::Router;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the internal event channel; slow subscribers skip events (`RecvError::Lagged`).
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle: `Idle --start--> Running --stop--> Stopped`. No way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayState::Idle => "idle",
            GatewayState::Running => "running",
            GatewayState::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway cannot start while {state}")]
    InvalidState { state: GatewayState },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
    #[error("serializing event payload: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Accepts connections from a transport and broadcasts envelopes to all of them.
///
/// One per server process by convention. Lifecycle events and inbound envelopes are
/// published on an internal channel (`subscribe`), kept separate from the broadcast path.
pub struct BroadcastGateway<F: ServerFactory> {
    factory: F,
    registry: ConnectionRegistry,
    state: Arc<Mutex<GatewayState>>,
    /// Kept alive for the gateway's lifetime once started.
    server: Mutex<Option<F::Server>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl<F: ServerFactory> BroadcastGateway<F> {
    pub fn new(factory: F) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            factory,
            registry: ConnectionRegistry::new(),
            state: Arc::new(Mutex::new(GatewayState::Idle)),
            server: Mutex::new(None),
            events,
        }
    }

    /// Create the transport server, subscribe to its accepted connections, and mount it
    /// on `router` under `/cb`. Returns the router with the transport routes added.
    ///
    /// Only valid from `Idle`. Factory errors are returned as-is and leave the gateway idle.
    pub fn start(&self, config: F::Config, router: Router) -> Result<Router, GatewayError> {
        let mut state = lock(&self.state);
        if *state != GatewayState::Idle {
            return Err(GatewayError::InvalidState { state: *state });
        }
        let mut server = self.factory.create_server(config)?;
        server.on_connection(self.connection_handler());
        let router = server.install_handlers(router, &HandlerOptions::new(ROUTE_PREFIX));
        *lock(&self.server) = Some(server);
        *state = GatewayState::Running;
        drop(state);

        log::info!("gateway started; transport mounted at {}", ROUTE_PREFIX);
        let _ = self.events.send(GatewayEvent::Started);
        Ok(router)
    }

    /// Disconnect every client and move to `Stopped`. Safe to call repeatedly.
    /// Returns how many clients this call disconnected.
    pub fn stop(&self) -> usize {
        let mut state = lock(&self.state);
        let closed = self.registry.close_all();
        let previous = std::mem::replace(&mut *state, GatewayState::Stopped);
        drop(state);

        if previous != GatewayState::Stopped {
            log::info!("gateway stopped; disconnected {} client(s)", closed);
            let _ = self.events.send(GatewayEvent::Stopped { closed });
        }
        closed
    }

    /// Wrap `data` as `{ eventName, data }` and write it to every tracked connection.
    ///
    /// Errors only when `data` cannot be serialized; per-connection failures are logged
    /// and counted in the report.
    pub fn emit<T>(&self, event_name: &str, data: &T) -> Result<BroadcastReport, GatewayError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data).map_err(GatewayError::Payload)?;
        Ok(self.broadcast(&Envelope::new(event_name, data)))
    }

    /// Write a prepared envelope to every tracked connection, in acceptance order.
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let connections = self.registry.all();
        let mut report = BroadcastReport {
            recipients: connections.len(),
            ..BroadcastReport::default()
        };
        for connection in &connections {
            match connection.write(envelope) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        "broadcast {:?} to {} failed: {}",
                        envelope.event_name,
                        connection.label(),
                        e
                    );
                }
            }
        }
        log::debug!(
            "broadcast {:?}: {} recipient(s), {} failed",
            envelope.event_name,
            report.recipients,
            report.failed
        );
        let _ = self.events.send(GatewayEvent::Broadcast {
            event_name: envelope.event_name.clone(),
            report,
        });
        report
    }

    /// Receive lifecycle, connection, broadcast, and inbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> GatewayState {
        *lock(&self.state)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Handler given to the transport: track while running, refuse otherwise.
    fn connection_handler(&self) -> ConnectionHandler {
        let registry = self.registry.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        Arc::new(move |connection: SharedConnection| {
            // Held across `track` so a concurrent `stop` cannot miss this connection.
            let current = lock(&state);
            if *current != GatewayState::Running {
                drop(current);
                log::debug!("refusing {}: gateway not running", connection.label());
                let _ = connection.close();
                return;
            }
            let tracked = registry.track(connection.clone());
            drop(current);
            if !tracked {
                return;
            }

            let open = registry.len();
            log::debug!("{} connected ({} open)", connection.label(), open);
            let _ = events.send(GatewayEvent::ConnectionOpened { connections: open });

            // Weak: the registry holds this connection, which holds this callback.
            let closed_registry = registry.downgrade();
            let closed_events = events.clone();
            connection.on_close(Box::new(move || {
                let open = closed_registry.upgrade().map_or(0, |r| r.len());
                let _ = closed_events.send(GatewayEvent::ConnectionClosed { connections: open });
            }));

            let inbound_events = events.clone();
            let label = connection.label();
            connection.on_message(Box::new(move |text: &str| {
                match serde_json::from_str::<Envelope>(text) {
                    Ok(envelope) => {
                        let _ = inbound_events.send(GatewayEvent::Inbound(envelope));
                    }
                    Err(e) => log::debug!("{}: ignoring non-envelope frame: {}", label, e),
                }
            }));
        })
    }
}

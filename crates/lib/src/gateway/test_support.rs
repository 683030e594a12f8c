//! In-memory doubles for the connection and transport contracts.

use super::connection::{
    CloseCallback, CloseSignal, Connection, ConnectionError, MessageCallback, SharedConnection,
};
use super::lock;
use super::protocol::Envelope;
use super::transport::{ConnectionHandler, HandlerOptions, ServerFactory, TransportServer};
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records writes and closes; `failing` connections reject both.
#[derive(Default)]
pub(crate) struct FakeConnection {
    fail: bool,
    writes: Mutex<Vec<Envelope>>,
    closes: AtomicUsize,
    signal: CloseSignal,
    message_handlers: Mutex<Vec<MessageCallback>>,
}

impl FakeConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub(crate) fn writes(&self) -> Vec<Envelope> {
        lock(&self.writes).clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simulate the remote side hanging up.
    pub(crate) fn peer_close(&self) {
        self.signal.fire();
    }

    /// Simulate an inbound text frame.
    pub(crate) fn deliver(&self, text: &str) {
        for handler in lock(&self.message_handlers).iter() {
            handler(text);
        }
    }
}

impl Connection for FakeConnection {
    fn write(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.fail {
            return Err(ConnectionError::BufferFull);
        }
        lock(&self.writes).push(envelope.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.signal.fire();
        if self.fail {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    fn is_closed(&self) -> bool {
        self.signal.is_fired()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.signal.subscribe(callback);
    }

    fn on_message(&self, callback: MessageCallback) {
        lock(&self.message_handlers).push(callback);
    }
}

/// What the fake transport saw.
#[derive(Default)]
pub(crate) struct TransportCalls {
    pub(crate) created: AtomicUsize,
    pub(crate) subscriptions: AtomicUsize,
    pub(crate) installs: Mutex<Vec<HandlerOptions>>,
    handler: Mutex<Option<ConnectionHandler>>,
}

/// Factory double; config is any JSON value, `rejecting` fails every `create_server`.
#[derive(Clone, Default)]
pub(crate) struct FakeFactory {
    pub(crate) calls: Arc<TransportCalls>,
    rejecting: bool,
}

impl FakeFactory {
    pub(crate) fn rejecting() -> Self {
        Self {
            rejecting: true,
            ..Self::default()
        }
    }

    /// Hand a connection to whatever handler the gateway subscribed.
    pub(crate) fn accept(&self, connection: Arc<FakeConnection>) {
        let connection: SharedConnection = connection;
        let handler = lock(&self.calls.handler).clone();
        if let Some(handler) = handler {
            handler(connection);
        }
    }
}

pub(crate) struct FakeServer {
    calls: Arc<TransportCalls>,
}

impl ServerFactory for FakeFactory {
    type Config = serde_json::Value;
    type Server = FakeServer;

    fn create_server(&self, _config: serde_json::Value) -> anyhow::Result<FakeServer> {
        self.calls.created.fetch_add(1, Ordering::SeqCst);
        if self.rejecting {
            anyhow::bail!("transport rejected config");
        }
        Ok(FakeServer {
            calls: self.calls.clone(),
        })
    }
}

impl TransportServer for FakeServer {
    fn on_connection(&mut self, handler: ConnectionHandler) {
        self.calls.subscriptions.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls.handler) = Some(handler);
    }

    fn install_handlers(&self, router: Router, options: &HandlerOptions) -> Router {
        lock(&self.calls.installs).push(options.clone());
        router
    }
}

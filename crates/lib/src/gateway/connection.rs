//! Connection contract: what the registry and gateway need from one client channel.
//!
//! A connection can be written to, closed, and observed for closing. The registry never
//! looks further inside; identity is the `Arc` allocation, not an id.

use super::lock;
use super::protocol::Envelope;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Invoked once when a connection closes.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Invoked for every inbound text frame.
pub type MessageCallback = Box<dyn Fn(&str) + Send + Sync + 'static>;

/// A tracked connection as shared between registry, gateway, and transport.
pub type SharedConnection = Arc<dyn Connection>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound buffer is full")]
    BufferFull,
    #[error("encoding frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle to one client's bidirectional channel.
///
/// `write` and `close` must not block: they hand work to the transport and return.
pub trait Connection: Send + Sync {
    /// Short label for log lines.
    fn label(&self) -> String {
        "connection".to_string()
    }

    fn write(&self, envelope: &Envelope) -> Result<(), ConnectionError>;

    fn close(&self) -> Result<(), ConnectionError>;

    fn is_closed(&self) -> bool;

    /// Subscribe to the close notification. Runs `callback` immediately if already closed.
    fn on_close(&self, callback: CloseCallback);

    /// Subscribe to inbound text frames. Transports without an inbound side ignore this.
    fn on_message(&self, _callback: MessageCallback) {}
}

/// Address of the connection's allocation; equal for clones of the same `Arc`.
pub(crate) fn identity(connection: &SharedConnection) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}

/// One-shot close notification for `Connection` implementations.
#[derive(Default)]
pub struct CloseSignal {
    state: Mutex<CloseState>,
}

#[derive(Default)]
struct CloseState {
    fired: bool,
    callbacks: Vec<CloseCallback>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fired(&self) -> bool {
        lock(&self.state).fired
    }

    pub fn subscribe(&self, callback: CloseCallback) {
        let mut g = lock(&self.state);
        if g.fired {
            drop(g);
            callback();
        } else {
            g.callbacks.push(callback);
        }
    }

    /// Fire once. Returns false when already fired. Callbacks run after the lock is released.
    pub fn fire(&self) -> bool {
        let callbacks = {
            let mut g = lock(&self.state);
            if g.fired {
                return false;
            }
            g.fired = true;
            std::mem::take(&mut g.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }
}

//! WebSocket transport on axum: one `GET` upgrade route, one `WsConnection` per socket.
//!
//! Each socket gets a bounded outbound queue drained by a writer loop, and a reader loop
//! that forwards text frames to `on_message` subscribers. Whichever side finishes first
//! ends the connection and fires its close notification.

use super::connection::{
    CloseCallback, CloseSignal, Connection, ConnectionError, MessageCallback, SharedConnection,
};
use super::lock;
use super::protocol::Envelope;
use super::transport::{ConnectionHandler, HandlerOptions, ServerFactory, TransportServer};
use crate::config::TransportConfig;
use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

type SharedMessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Builds `WsServer`s from `TransportConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsServerFactory;

impl ServerFactory for WsServerFactory {
    type Config = TransportConfig;
    type Server = WsServer;

    fn create_server(&self, config: TransportConfig) -> Result<WsServer> {
        config.validate()?;
        Ok(WsServer {
            config,
            handler: None,
        })
    }
}

pub struct WsServer {
    config: TransportConfig,
    handler: Option<ConnectionHandler>,
}

impl TransportServer for WsServer {
    fn on_connection(&mut self, handler: ConnectionHandler) {
        self.handler = Some(handler);
    }

    fn install_handlers(&self, router: Router, options: &HandlerOptions) -> Router {
        let state = WsRouteState {
            outbound_buffer: self.config.outbound_buffer,
            max_message_size: self.config.max_message_size,
            handler: self.handler.clone(),
        };
        let routes = Router::new()
            .route(&self.config.path, get(ws_upgrade))
            .with_state(state);
        log::debug!(
            "websocket transport mounted at {}{}",
            options.prefix,
            self.config.path
        );
        router.nest(&options.prefix, routes)
    }
}

#[derive(Clone)]
struct WsRouteState {
    outbound_buffer: usize,
    max_message_size: usize,
    handler: Option<ConnectionHandler>,
}

/// GET {prefix}{path} upgrades to WebSocket.
async fn ws_upgrade(State(state): State<WsRouteState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: WsRouteState) {
    let Some(handler) = state.handler else {
        log::warn!("websocket upgraded before a connection handler was installed; dropping");
        return;
    };
    let (tx, rx) = mpsc::channel(state.outbound_buffer);
    let connection = Arc::new(WsConnection::new(tx));
    let (sink, stream) = socket.split();

    let shared: SharedConnection = connection.clone();
    handler(shared);

    tokio::select! {
        _ = write_loop(sink, rx) => {}
        _ = read_loop(stream, &connection) => {}
    }
    connection.release();
    log::debug!(
        "client {} disconnected after {}s",
        connection.id(),
        (Utc::now() - connection.connected_at()).num_seconds()
    );
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() {
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WebSocket>, connection: &WsConnection) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.dispatch(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("client {} read failed: {}", connection.id(), e);
                break;
            }
        }
    }
}

/// One accepted WebSocket client.
pub struct WsConnection {
    id: String,
    connected_at: DateTime<Utc>,
    /// Taken on close; `None` means no more frames are accepted.
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    signal: CloseSignal,
    message_handlers: Mutex<Vec<SharedMessageCallback>>,
}

impl WsConnection {
    fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connected_at: Utc::now(),
            outbound: Mutex::new(Some(outbound)),
            signal: CloseSignal::new(),
            message_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Socket finished: stop accepting frames and notify once.
    fn release(&self) {
        lock(&self.outbound).take();
        self.signal.fire();
    }

    fn dispatch(&self, text: &str) {
        let handlers = lock(&self.message_handlers).clone();
        for handler in handlers {
            handler(text);
        }
    }
}

impl Connection for WsConnection {
    fn label(&self) -> String {
        format!("client {}", self.id)
    }

    fn write(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let text = envelope.to_text()?;
        let g = lock(&self.outbound);
        let Some(tx) = g.as_ref() else {
            return Err(ConnectionError::Closed);
        };
        tx.try_send(Message::Text(text)).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::BufferFull,
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    fn close(&self) -> Result<(), ConnectionError> {
        let Some(tx) = lock(&self.outbound).take() else {
            return Ok(());
        };
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: Cow::Borrowed("server closing"),
        }));
        if tx.try_send(frame).is_err() {
            log::debug!("client {}: close frame not queued", self.id);
        }
        // Dropping the last sender lets the writer drain and finish.
        drop(tx);
        self.signal.fire();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.signal.is_fired()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.signal.subscribe(callback);
    }

    fn on_message(&self, callback: MessageCallback) {
        lock(&self.message_handlers).push(Arc::from(callback));
    }
}

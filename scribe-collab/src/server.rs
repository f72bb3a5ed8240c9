//! WebSocket server driving one shared document.
//!
//! Architecture:
//! ```text
//! Client A ── conn task ──┐                          ┌── outbound A ── writer A ── Client A
//!                          ├── Command ── coordinator ┤
//! Client B ── conn task ──┘     (mpsc)     (actor)    └── outbound B ── writer B ── Client B
//!                                             │
//!                                      Document + SessionRegistry
//! ```
//!
//! Every connection runs a reader loop that forwards frames to the coordinator
//! task as [`Command`]s. The coordinator is the only owner of the document and
//! the sessions, so commands are processed strictly one at a time. Frames for a
//! client are enqueued on its bounded outbound queue and written to the socket
//! by that connection's writer task, under a write deadline, alongside periodic
//! heartbeat pings.
//!
//! The client identifier comes from the `clientId` request header (or the
//! `clientId` query parameter). Upgrades without one are refused with HTTP 400.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use scribe_core::{ClientId, DEFAULT_HISTORY_CAPACITY};

use crate::broadcast::{BroadcastCoordinator, CoordinatorStats};
use crate::session::{Outbound, SessionError, SessionHandle};

/// Header (and query parameter) carrying the client identifier.
pub const CLIENT_ID_HEADER: &str = "clientId";

const COMMAND_QUEUE_CAPACITY: usize = 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Operations kept per client for transformation
    pub history_capacity: usize,
    /// Frames buffered per client before it counts as stalled
    pub outbound_capacity: usize,
    /// Close a connection after this long without any inbound frame
    pub idle_timeout_secs: u64,
    /// Deadline for a single frame write
    pub write_timeout_secs: u64,
    /// Interval between heartbeat pings
    pub heartbeat_interval_secs: u64,
    /// How long shutdown waits for connections to finish
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            outbound_capacity: 256,
            idle_timeout_secs: 90,
            write_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            drain_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SCRIBE_*` environment variables. Values that do
    /// not parse, and zero counts or durations, are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let positive = |key: &str| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .filter(|n| *n > 0)
        };

        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(n) = positive("SCRIBE_HISTORY_CAPACITY") {
            config.history_capacity = n as usize;
        }
        if let Some(n) = positive("SCRIBE_OUTBOUND_CAPACITY") {
            config.outbound_capacity = n as usize;
        }
        if let Some(secs) = positive("SCRIBE_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = positive("SCRIBE_WRITE_TIMEOUT_SECS") {
            config.write_timeout_secs = secs;
        }
        if let Some(secs) = positive("SCRIBE_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = positive("SCRIBE_DRAIN_TIMEOUT_SECS") {
            config.drain_timeout_secs = secs;
        }

        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// WebSocket upgrades attempted since start
    pub total_connections: u64,
    pub coordinator: CoordinatorStats,
}

/// Work for the coordinator task.
#[derive(Debug)]
enum Command {
    Join {
        client_id: ClientId,
        outbound: Outbound,
        reply: oneshot::Sender<Result<SessionHandle, SessionError>>,
    },
    Submit {
        client_id: ClientId,
        frame: Vec<u8>,
    },
    Leave {
        handle: SessionHandle,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
    Document {
        reply: oneshot::Sender<String>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Process commands until shutdown or until every sender is gone.
async fn run_coordinator(
    mut coordinator: BroadcastCoordinator,
    mut commands: mpsc::Receiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Join {
                client_id,
                outbound,
                reply,
            } => {
                let _ = reply.send(coordinator.join(client_id, outbound));
            }
            Command::Submit { client_id, frame } => {
                match coordinator.submit(&client_id, &frame) {
                    Ok(applied) => log::debug!(
                        "Applied {} from {client_id}, delivered to {} peers",
                        applied.operation,
                        applied.delivered
                    ),
                    Err(e) => log::warn!("Rejected frame from {client_id}: {e}"),
                }
            }
            Command::Leave { handle } => {
                coordinator.leave(&handle);
            }
            Command::Stats { reply } => {
                let _ = reply.send(coordinator.stats());
            }
            Command::Document { reply } => {
                let _ = reply.send(coordinator.document().text().to_string());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(coordinator.shutdown());
                break;
            }
        }
    }
    log::debug!("Coordinator stopped");
}

/// Cloneable control surface for a server that is running.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    total_connections: Arc<AtomicU64>,
}

impl ServerHandle {
    /// Current statistics, or `None` once the coordinator has stopped.
    pub async fn stats(&self) -> Option<ServerStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).await.ok()?;
        let coordinator = rx.await.ok()?;
        Some(ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            coordinator,
        })
    }

    /// Current document text, or `None` once the coordinator has stopped.
    pub async fn document(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Document { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Ask the server to stop accepting, close every session and drain.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Per-connection settings and the way back to the coordinator.
#[derive(Debug, Clone)]
struct ConnectionContext {
    commands: mpsc::Sender<Command>,
    outbound_capacity: usize,
    idle_timeout: Duration,
    write_timeout: Duration,
    heartbeat_interval: Duration,
}

/// The collaboration server.
pub struct OtServer {
    config: ServerConfig,
    handle: ServerHandle,
    commands: mpsc::Receiver<Command>,
}

impl OtServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            handle: ServerHandle {
                commands: commands_tx,
                shutdown: Arc::new(shutdown),
                total_connections: Arc::new(AtomicU64::new(0)),
            },
            commands,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Bind `bind_addr` and serve until [`ServerHandle::shutdown`] is called.
    pub async fn run(self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BoxError> {
        let Self {
            config,
            handle,
            commands,
        } = self;

        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let coordinator = BroadcastCoordinator::new(config.history_capacity);
        let coordinator_task = tokio::spawn(run_coordinator(coordinator, commands));

        let context = ConnectionContext {
            commands: handle.commands.clone(),
            outbound_capacity: config.outbound_capacity.max(1),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        };

        let shutdown = shutdown_requested(handle.shutdown.subscribe());
        tokio::pin!(shutdown);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        handle.total_connections.fetch_add(1, Ordering::Relaxed);
                        let context = context.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, context).await {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        log::info!("Shutting down, {} connections open", connections.len());

        let (reply, closed) = oneshot::channel();
        if handle.commands.send(Command::Shutdown { reply }).await.is_ok() {
            if let Ok(count) = closed.await {
                log::debug!("Closed {count} sessions");
            }
        }

        let drain_timeout = Duration::from_secs(config.drain_timeout_secs);
        let drained = timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "Drain timed out after {drain_timeout:?}, aborting {} connections",
                connections.len()
            );
            connections.shutdown().await;
        }

        drop(context);
        coordinator_task.await?;
        log::info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Pull the client identifier from the `clientId` header, falling back to
/// the query string. Blank values count as missing.
fn client_id_from_request(request: &Request) -> Option<ClientId> {
    let from_header = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let from_query = || {
        request.uri().query().and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == CLIENT_ID_HEADER)
                .map(|(_, id)| id.trim())
                .filter(|id| !id.is_empty())
        })
    };

    from_header.or_else(from_query).map(ClientId::from)
}

fn missing_client_id() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("missing {CLIENT_ID_HEADER}")));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: ConnectionContext,
) -> Result<(), BoxError> {
    let mut client_id = None;
    let mut ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| match client_id_from_request(request) {
            Some(id) => {
                client_id = Some(id);
                Ok(response)
            }
            None => Err(missing_client_id()),
        },
    )
    .await?;

    let Some(client_id) = client_id else {
        return Ok(());
    };
    log::info!("WebSocket connection established from {addr} as {client_id}");

    let (outbound, outbound_rx) = mpsc::channel(context.outbound_capacity);
    let (reply, joined) = oneshot::channel();
    context
        .commands
        .send(Command::Join {
            client_id: client_id.clone(),
            outbound,
            reply,
        })
        .await?;

    let handle = match joined.await? {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("Refusing {client_id} from {addr}: {e}");
            let close = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            let _ = timeout(context.write_timeout, ws_stream.close(Some(close))).await;
            return Ok(());
        }
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let mut writer = tokio::spawn(write_loop(
        ws_sender,
        outbound_rx,
        client_id.clone(),
        context.heartbeat_interval,
        context.write_timeout,
    ));
    let mut writer_done = false;

    loop {
        let next = tokio::select! {
            next = timeout(context.idle_timeout, ws_receiver.next()) => next,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };

        let frame = match next {
            Err(_) => {
                log::info!("Client {client_id} idle for {:?}, closing", context.idle_timeout);
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                log::debug!("Read from {client_id} failed: {e}");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => text.as_bytes().to_vec(),
            Ok(Some(Ok(Message::Binary(data)))) => data.to_vec(),
            // Pings are answered by tungstenite; pongs only refresh the deadline
            Ok(Some(Ok(_))) => continue,
        };

        let submit = Command::Submit {
            client_id: client_id.clone(),
            frame,
        };
        if context.commands.send(submit).await.is_err() {
            break;
        }
    }

    let _ = context.commands.send(Command::Leave { handle }).await;
    if !writer_done {
        // Leaving closes the outbound queue, which lets the writer finish
        if timeout(context.write_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
    }
    log::info!("Client {client_id} disconnected ({addr})");
    Ok(())
}

/// Write queued frames and heartbeats until the queue closes or a write fails.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<String>,
    client_id: ClientId,
    heartbeat_interval: Duration,
    write_timeout: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.into()),
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Default::default()),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("Write to {client_id} failed: {e}");
                return;
            }
            Err(_) => {
                log::warn!("Write to {client_id} timed out after {write_timeout:?}");
                return;
            }
        }
    }

    let _ = timeout(write_timeout, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(uri: &str, header: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(id) = header {
            builder = builder.header(CLIENT_ID_HEADER, id);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.idle_timeout_secs, 90);
    }

    #[test]
    fn test_config_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SCRIBE_BIND_ADDR", "0.0.0.0:9000"),
            ("SCRIBE_HISTORY_CAPACITY", "16"),
            ("SCRIBE_WRITE_TIMEOUT_SECS", "not-a-number"),
            ("SCRIBE_HEARTBEAT_SECS", "0"),
            ("SCRIBE_DRAIN_TIMEOUT_SECS", " 2 "),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.history_capacity, 16);
        assert_eq!(config.write_timeout_secs, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.drain_timeout_secs, 2);
    }

    #[test]
    fn test_client_id_from_header() {
        let id = client_id_from_request(&request("/ws", Some("alice")));
        assert_eq!(id, Some(ClientId::from("alice")));
    }

    #[test]
    fn test_client_id_header_wins_over_query() {
        let id = client_id_from_request(&request("/ws?clientId=bob", Some("alice")));
        assert_eq!(id, Some(ClientId::from("alice")));
    }

    #[test]
    fn test_client_id_from_query() {
        let id = client_id_from_request(&request("/?room=1&clientId=bob", None));
        assert_eq!(id, Some(ClientId::from("bob")));
    }

    #[test]
    fn test_missing_client_id() {
        assert_eq!(client_id_from_request(&request("/ws", None)), None);
        assert_eq!(client_id_from_request(&request("/ws", Some("  "))), None);
        assert_eq!(client_id_from_request(&request("/ws?clientId=", None)), None);
        assert_eq!(missing_client_id().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_coordinator_task_serializes_commands() {
        let (commands, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_coordinator(BroadcastCoordinator::new(10), rx));

        let (outbound, mut frames) = mpsc::channel(16);
        let (reply, joined) = oneshot::channel();
        commands
            .send(Command::Join {
                client_id: ClientId::from("alice"),
                outbound,
                reply,
            })
            .await
            .unwrap();
        let handle = joined.await.unwrap().unwrap();

        for frame in ["0:0:hi", "bogus", "0:2:!"] {
            commands
                .send(Command::Submit {
                    client_id: ClientId::from("alice"),
                    frame: frame.as_bytes().to_vec(),
                })
                .await
                .unwrap();
        }

        let (reply, text) = oneshot::channel();
        commands.send(Command::Document { reply }).await.unwrap();
        assert_eq!(text.await.unwrap(), "hi!");

        let (reply, stats) = oneshot::channel();
        commands.send(Command::Stats { reply }).await.unwrap();
        let stats = stats.await.unwrap();
        assert_eq!(stats.operations_applied, 2);
        assert_eq!(stats.malformed_frames, 1);

        commands.send(Command::Leave { handle }).await.unwrap();
        let (reply, closed) = oneshot::channel();
        commands.send(Command::Shutdown { reply }).await.unwrap();
        assert_eq!(closed.await.unwrap(), 0);
        task.await.unwrap();

        // Leaving closed the outbound queue without sending anything
        assert!(frames.recv().await.is_none());
    }
}

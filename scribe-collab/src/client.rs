//! WebSocket client for connecting an editor to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Operation send with the line protocol
//! - An event stream of remote operations, already transformed by the server
//!   into document coordinates for this client

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use scribe_core::{ClientId, Operation, OperationId};

use crate::protocol;

/// Origin recorded on operations received from the server.
pub const SERVER_ORIGIN: &str = "server";

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the editor client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// An operation to apply to the local copy. The first one after joining a
    /// non-empty document is the full text inserted at offset 0.
    RemoteOperation(Operation),
    /// Connection lost or closed by the server
    Disconnected,
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The client id cannot be sent as a header value
    InvalidClientId(String),
    /// Handshake failed, including an HTTP refusal from the server
    Connect(String),
    NotConnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidClientId(id) => write!(f, "Invalid client ID: {id:?}"),
            Self::Connect(e) => write!(f, "Connection failed: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Editor-side connection to an `OtServer`.
pub struct EditorClient {
    client_id: ClientId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl EditorClient {
    pub fn new(server_url: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Create a client and connect it.
    pub async fn connect_to(
        server_url: impl Into<String>,
        client_id: impl Into<ClientId>,
    ) -> Result<Self, ClientError> {
        let mut client = Self::new(server_url, client_id);
        client.connect().await?;
        Ok(client)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server, identifying with the `clientId` header.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let result = self.open().await;
        if result.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
        }
        result
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let id = HeaderValue::from_str(self.client_id.as_str())
            .map_err(|_| ClientError::InvalidClientId(self.client_id.to_string()))?;
        // Header names are case-insensitive; the static form must be lowercase
        request.headers_mut().insert("clientid", id);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            let origin = ClientId::from(SERVER_ORIGIN);
            while let Some(msg) = ws_reader.next().await {
                let bytes = match msg {
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match protocol::decode(&bytes, &origin) {
                    Ok(op) => {
                        let _ = event_tx.send(ClientEvent::RemoteOperation(op)).await;
                    }
                    Err(e) => log::warn!("Client {client_id} skipped frame: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        log::debug!("Client {} connected to {}", self.client_id, self.server_url);
        Ok(())
    }

    /// Close the connection once queued frames are written.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Send an operation. Its position must be in this client's current view
    /// of the document; the sequence number is ignored.
    pub async fn send_operation(&self, op: &Operation) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(protocol::encode(op))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn send_insert(
        &self,
        position: usize,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        let op = Operation::insert(self.operation_id(), position, content);
        self.send_operation(&op).await
    }

    pub async fn send_delete(
        &self,
        position: usize,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        let op = Operation::delete(self.operation_id(), position, content);
        self.send_operation(&op).await
    }

    fn operation_id(&self) -> OperationId {
        OperationId::new(self.client_id.clone(), 0)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

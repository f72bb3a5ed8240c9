//! Per-client session state and the registry that owns it.
//!
//! A session owns its outbound queue (the transport handle as far as the
//! coordinator is concerned), its bounded history of operations delivered to
//! it, and its next sequence number. The registry is only ever touched from
//! the coordinator task, so `&mut` access is the per-session exclusion and no
//! lock is held across any network write: sends are non-blocking enqueues.

use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use scribe_core::{ClientId, HistoryBuffer, Operation};

/// Sending half of a session's outbound frame queue.
pub type Outbound = mpsc::Sender<String>;

/// Identifies one registration of a client id.
///
/// The token lets a connection task unregister exactly the session it created,
/// even if the same client id has since reconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub client_id: ClientId,
    pub token: Uuid,
}

/// State for one connected client.
#[derive(Debug)]
pub struct ClientSession {
    handle: SessionHandle,
    outbound: Outbound,
    history: HistoryBuffer,
    next_sequence: u64,
}

impl ClientSession {
    fn new(client_id: ClientId, outbound: Outbound, history_capacity: usize) -> Self {
        Self {
            handle: SessionHandle {
                client_id,
                token: Uuid::new_v4(),
            },
            outbound,
            history: HistoryBuffer::new(history_capacity),
            next_sequence: 0,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.handle.client_id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// The sequence number the next accepted operation will receive.
    pub fn peek_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Push onto this session's history window, evicting the oldest entry
    /// when full.
    pub fn append_history(&mut self, op: Operation) {
        if let Some(evicted) = self.history.push(op) {
            log::trace!("History of {} evicted {evicted}", self.handle.client_id);
        }
    }

    /// Enqueue a frame without waiting.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// All connected sessions, keyed by client id.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<ClientId, ClientSession>,
    history_capacity: usize,
}

impl SessionRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            history_capacity,
        }
    }

    /// Create a session with empty history and sequence 0.
    ///
    /// A client id that is already connected is refused; the existing session
    /// is left untouched.
    pub fn register(
        &mut self,
        client_id: ClientId,
        outbound: Outbound,
    ) -> Result<SessionHandle, SessionError> {
        if client_id.is_empty() {
            return Err(SessionError::EmptyClientId);
        }
        if self.sessions.contains_key(&client_id) {
            return Err(SessionError::DuplicateClient(client_id));
        }

        let session = ClientSession::new(client_id.clone(), outbound, self.history_capacity);
        let handle = session.handle().clone();
        self.sessions.insert(client_id, session);
        Ok(handle)
    }

    /// Hand out the next sequence number for `client_id`.
    pub fn next_sequence_number(&mut self, client_id: &ClientId) -> Result<u64, SessionError> {
        self.get_mut(client_id).map(ClientSession::take_sequence)
    }

    /// Record an operation in the client's history window.
    pub fn append_history(
        &mut self,
        client_id: &ClientId,
        op: Operation,
    ) -> Result<(), SessionError> {
        self.get_mut(client_id).map(|session| session.append_history(op))
    }

    /// Remove a session. Dropping it closes its outbound queue, which ends the
    /// connection's writer once queued frames are flushed.
    pub fn unregister(&mut self, client_id: &ClientId) -> Option<ClientSession> {
        self.sessions.remove(client_id)
    }

    /// Remove the session only if it is still the registration `handle` names.
    pub fn unregister_handle(&mut self, handle: &SessionHandle) -> Option<ClientSession> {
        let current = self
            .sessions
            .get(&handle.client_id)
            .is_some_and(|session| session.handle.token == handle.token);
        if current {
            self.sessions.remove(&handle.client_id)
        } else {
            None
        }
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<ClientSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    fn get_mut(&mut self, client_id: &ClientId) -> Result<&mut ClientSession, SessionError> {
        self.sessions
            .get_mut(client_id)
            .ok_or_else(|| SessionError::UnknownClient(client_id.clone()))
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.sessions.keys().cloned().collect()
    }
}

/// Session lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    EmptyClientId,
    DuplicateClient(ClientId),
    UnknownClient(ClientId),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyClientId => write!(f, "Client ID not provided"),
            Self::DuplicateClient(id) => write!(f, "Client {id} is already connected"),
            Self::UnknownClient(id) => write!(f, "No session for client {id}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Failure to enqueue a frame for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound queue is full; the peer is not keeping up
    Backlogged,
    /// The connection's writer is gone
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backlogged => write!(f, "Outbound queue full"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

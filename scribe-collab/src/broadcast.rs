//! Apply-then-fan-out for accepted operations.
//!
//! `BroadcastCoordinator` owns the document and the session registry together,
//! so everything one incoming frame causes (decode, transform, apply, per-peer
//! transform, history updates, enqueue) happens inside a single `&mut self`
//! call. The server runs it on one task and feeds it commands, which gives a
//! strict total order of operations across all clients.
//!
//! Pipeline for one frame from `origin`:
//! ```text
//! bytes ─ decode ─ seq# ─ transform(origin.history) ─ apply ─┬─ peer A: transform(A.history) → A.history, A.outbound
//!                                                             ├─ peer B: transform(B.history) → B.history, B.outbound
//!                                                             └─ …
//! ```
//! Peers whose outbound queue is closed or full are collected during the pass
//! and unregistered after it.

use scribe_core::{transform_against_history, ApplyError, ClientId, Document, Operation};

use crate::protocol::{self, ProtocolError};
use crate::session::{Outbound, SessionError, SessionHandle, SessionRegistry};

/// Counters for monitoring the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub total_sessions: u64,
    pub active_sessions: usize,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub malformed_frames: u64,
    pub peers_dropped: u64,
    pub document_len: usize,
    pub document_version: u64,
}

/// Result of a successfully applied frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// The operation as applied to the document
    pub operation: Operation,
    /// Peers the operation was enqueued for
    pub delivered: usize,
    /// Peers removed because their queue was closed or full
    pub dropped: Vec<ClientId>,
}

/// Single owner of the shared document and all sessions.
#[derive(Debug)]
pub struct BroadcastCoordinator {
    document: Document,
    registry: SessionRegistry,
    stats: CoordinatorStats,
}

impl BroadcastCoordinator {
    pub fn new(history_capacity: usize) -> Self {
        Self::with_document(Document::new(), history_capacity)
    }

    pub fn with_document(document: Document, history_capacity: usize) -> Self {
        Self {
            document,
            registry: SessionRegistry::new(history_capacity),
            stats: CoordinatorStats::default(),
        }
    }

    /// Register a client. If the document already has content, the new
    /// session's first frame is a snapshot insert at offset 0.
    pub fn join(
        &mut self,
        client_id: ClientId,
        outbound: Outbound,
    ) -> Result<SessionHandle, SessionError> {
        let handle = self.registry.register(client_id, outbound)?;
        self.stats.total_sessions += 1;

        if !self.document.is_empty() {
            let snapshot = protocol::encode_snapshot(self.document.text());
            let sent = self
                .registry
                .get(&handle.client_id)
                .map(|session| session.send(snapshot));
            if let Some(Err(e)) = sent {
                log::warn!("Snapshot for {} not delivered: {e}", handle.client_id);
                self.drop_peer(&handle.client_id);
            }
        }

        log::info!(
            "Client {} joined ({} sessions, document length {})",
            handle.client_id,
            self.registry.len(),
            self.document.len()
        );
        Ok(handle)
    }

    /// Remove the session created by `handle`, if it is still registered.
    pub fn leave(&mut self, handle: &SessionHandle) -> bool {
        let removed = self.registry.unregister_handle(handle).is_some();
        if removed {
            log::info!(
                "Client {} left ({} sessions)",
                handle.client_id,
                self.registry.len()
            );
        }
        removed
    }

    /// Decode, transform, apply and fan out one frame from `origin`.
    ///
    /// The frame carries no revision, so it is transformed against every
    /// operation still in the origin's window. Operations the origin itself
    /// sent never shift it. Operations delivered to the origin do, even if
    /// the client had already applied them before editing; such an edit
    /// lands further right than intended or is rejected as out of bounds.
    /// The same holds for peer copies: an operation is moved past every
    /// other client's entry in the peer's window, so with three or more
    /// editors a copy can overshoot on an observer.
    pub fn submit(&mut self, origin: &ClientId, frame: &[u8]) -> Result<Applied, SubmitError> {
        if !self.registry.contains(origin) {
            self.stats.operations_rejected += 1;
            return Err(SessionError::UnknownClient(origin.clone()).into());
        }

        let mut op = protocol::decode(frame, origin).map_err(|e| {
            self.stats.malformed_frames += 1;
            e
        })?;
        op.id.sequence = self.registry.next_sequence_number(origin)?;

        let operation = match self.registry.get(origin) {
            Some(session) => transform_against_history(&op, session.history()),
            None => return Err(SessionError::UnknownClient(origin.clone()).into()),
        };

        if let Err(e) = self.document.apply(&operation) {
            self.stats.operations_rejected += 1;
            return Err(e.into());
        }
        self.stats.operations_applied += 1;
        log::trace!("Applied {operation} (received as {op})");

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for peer in self.registry.sessions_mut() {
            if peer.client_id() == origin {
                continue;
            }

            let peer_op = transform_against_history(&operation, peer.history());
            let frame = protocol::encode(&peer_op);
            peer.append_history(peer_op);

            match peer.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Dropping client {}: {e}", peer.client_id());
                    dropped.push(peer.client_id().clone());
                }
            }
        }

        for client_id in &dropped {
            self.drop_peer(client_id);
        }

        Ok(Applied {
            operation,
            delivered,
            dropped,
        })
    }

    /// Unregister every session. Each outbound queue closes, so writers flush
    /// what is already queued and then close their connection.
    pub fn shutdown(&mut self) -> usize {
        let drained = self.registry.drain().len();
        log::info!("Coordinator shut down, {drained} sessions closed");
        drained
    }

    fn drop_peer(&mut self, client_id: &ClientId) {
        if self.registry.unregister(client_id).is_some() {
            self.stats.peers_dropped += 1;
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            active_sessions: self.registry.len(),
            document_len: self.document.len(),
            document_version: self.document.version(),
            ..self.stats.clone()
        }
    }
}

/// Why a frame was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    Session(SessionError),
    Malformed(ProtocolError),
    Rejected(ApplyError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(e) => write!(f, "{e}"),
            Self::Malformed(e) => write!(f, "{e}"),
            Self::Rejected(e) => write!(f, "Operation rejected: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<SessionError> for SubmitError {
    fn from(e: SessionError) -> Self {
        SubmitError::Session(e)
    }
}

impl From<ProtocolError> for SubmitError {
    fn from(e: ProtocolError) -> Self {
        SubmitError::Malformed(e)
    }
}

impl From<ApplyError> for SubmitError {
    fn from(e: ApplyError) -> Self {
        SubmitError::Rejected(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::OperationId;
    use tokio::sync::mpsc;

    struct Peer {
        id: ClientId,
        rx: mpsc::Receiver<String>,
    }

    impl Peer {
        fn frames(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    fn join(coordinator: &mut BroadcastCoordinator, name: &str) -> Peer {
        let (tx, rx) = mpsc::channel(16);
        let id = ClientId::from(name);
        coordinator.join(id.clone(), tx).unwrap();
        Peer { id, rx }
    }

    /// Apply wire frames in order, the way an editor replica would.
    fn replay<S: AsRef<str>>(replica: &mut Document, frames: &[S]) {
        let origin = ClientId::from("server");
        for frame in frames {
            let op = protocol::decode(frame.as_ref().as_bytes(), &origin).unwrap();
            replica
                .apply(&op)
                .unwrap_or_else(|e| panic!("replica rejected {}: {e}", frame.as_ref()));
        }
    }

    #[test]
    fn test_observer_replica_follows_successive_edits() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let a = join(&mut coordinator, "A");
        let mut b = join(&mut coordinator, "B");

        for frame in ["0:0:hello", "0:5:!", "1:0:h"] {
            coordinator.submit(&a.id, frame.as_bytes()).unwrap();
        }
        assert_eq!(coordinator.document().text(), "ello!");

        let frames = b.frames();
        assert_eq!(frames, vec!["0:0:hello", "0:5:!", "1:0:h"]);
        let mut replica = Document::new();
        replay(&mut replica, &frames);
        assert_eq!(replica.text(), coordinator.document().text());
    }

    #[test]
    fn test_interleaved_bursts_converge_on_replicas() {
        let mut coordinator = BroadcastCoordinator::with_document(Document::from_text("ab"), 100);
        let mut a = join(&mut coordinator, "A");
        let mut b = join(&mut coordinator, "B");
        let mut a_replica = Document::new();
        let mut b_replica = Document::new();
        replay(&mut a_replica, &a.frames());
        replay(&mut b_replica, &b.frames());

        // Each client types two characters locally before anything arrives
        let a_local = ["0:0:x", "0:1:z"];
        let b_local = ["0:0:y", "0:1:w"];
        replay(&mut a_replica, &a_local);
        replay(&mut b_replica, &b_local);

        for frame in a_local {
            coordinator.submit(&a.id, frame.as_bytes()).unwrap();
        }
        for frame in b_local {
            coordinator.submit(&b.id, frame.as_bytes()).unwrap();
        }
        assert_eq!(coordinator.document().text(), "xzywab");

        replay(&mut a_replica, &a.frames());
        replay(&mut b_replica, &b.frames());
        assert_eq!(a_replica.text(), "xzywab");
        assert_eq!(b_replica.text(), "xzywab");
    }

    #[test]
    fn test_huge_position_rejected() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let mut a = join(&mut coordinator, "A");
        let b = join(&mut coordinator, "B");
        coordinator.submit(&a.id, b"0:0:x").unwrap();

        let err = coordinator
            .submit(&b.id, b"0:18446744073709551615:y")
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Rejected(ApplyError::PositionOutOfBounds {
                position: usize::MAX,
                len: 1
            })
        );
        let err = coordinator
            .submit(&b.id, b"1:18446744073709551615:zz")
            .unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(_)));
        assert_eq!(coordinator.document().text(), "x");
        assert!(a.frames().is_empty());

        // The coordinator keeps serving both sessions
        coordinator.submit(&b.id, b"0:0:y").unwrap();
        assert_eq!(coordinator.document().text(), "xy");
        assert_eq!(a.frames(), vec!["0:1:y".to_string()]);
        assert_eq!(coordinator.stats().operations_rejected, 2);
    }

    #[test]
    fn test_end_to_end_sequence() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let mut a = join(&mut coordinator, "A");

        coordinator.submit(&a.id, b"0:0:hello").unwrap();
        assert_eq!(coordinator.document().text(), "hello");

        let mut b = join(&mut coordinator, "B");
        assert_eq!(b.frames(), vec!["0:0:hello".to_string()]);

        let applied = coordinator.submit(&b.id, b"0:5:!").unwrap();
        assert_eq!(applied.delivered, 1);
        assert_eq!(coordinator.document().text(), "hello!");

        // A never sees its own edit echoed, only B's
        assert_eq!(a.frames(), vec!["0:5:!".to_string()]);
        assert!(b.frames().is_empty());
    }

    #[test]
    fn test_sequence_numbers_assigned_at_receipt() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let a = join(&mut coordinator, "A");

        let first = coordinator.submit(&a.id, b"0:0:a").unwrap();
        let second = coordinator.submit(&a.id, b"0:1:b").unwrap();
        assert_eq!(first.operation.id, OperationId::new("A", 0));
        assert_eq!(second.operation.id, OperationId::new("A", 1));
    }

    #[test]
    fn test_concurrent_inserts_converge_at_server() {
        let mut coordinator = BroadcastCoordinator::with_document(Document::from_text("ab"), 100);
        let mut c1 = join(&mut coordinator, "c1");
        let mut c2 = join(&mut coordinator, "c2");
        c1.frames();
        c2.frames();

        // Both typed at offset 0 of "ab" before seeing each other's edit.
        coordinator.submit(&c1.id, b"0:0:x").unwrap();
        let applied = coordinator.submit(&c2.id, b"0:0:y").unwrap();

        assert_eq!(applied.operation.position, 1);
        assert_eq!(coordinator.document().text(), "xyab");

        // c1 applies "y" at 1 on top of "xab"; c2 applies "x" at 0 on top of "yab".
        assert_eq!(c1.frames(), vec!["0:1:y".to_string()]);
        assert_eq!(c2.frames(), vec!["0:0:x".to_string()]);
    }

    #[test]
    fn test_peer_copies_follow_each_history() {
        let mut coordinator = BroadcastCoordinator::with_document(Document::from_text("abc"), 100);
        let c1 = join(&mut coordinator, "c1");
        let mut c2 = join(&mut coordinator, "c2");
        let mut c3 = join(&mut coordinator, "c3");

        coordinator.submit(&c1.id, b"0:0:xx").unwrap();
        c2.frames();
        c3.frames();

        // c3's window as it stands before c2's edit arrives
        let c3_history: Vec<Operation> = coordinator
            .registry()
            .get(&c3.id)
            .unwrap()
            .history()
            .iter()
            .cloned()
            .collect();

        let applied = coordinator.submit(&c2.id, b"1:1:b").unwrap();
        let expected_for_c3 = transform_against_history(&applied.operation, &c3_history);
        assert_eq!(c3.frames(), vec![protocol::encode(&expected_for_c3)]);

        let c3_window = coordinator.registry().get(&c3.id).unwrap().history();
        assert_eq!(c3_window.len(), 2);
        assert!(coordinator
            .registry()
            .get(&c2.id)
            .unwrap()
            .history()
            .iter()
            .all(|op| op.id.client_id != c2.id));
    }

    #[test]
    fn test_malformed_frame_rejected_without_side_effects() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let a = join(&mut coordinator, "A");
        let mut b = join(&mut coordinator, "B");

        let err = coordinator.submit(&a.id, b"garbage").unwrap_err();
        assert!(matches!(err, SubmitError::Malformed(_)));
        assert!(coordinator.document().is_empty());
        assert!(b.frames().is_empty());
        assert!(coordinator.registry().contains(&a.id));

        // Still usable afterwards
        coordinator.submit(&a.id, b"0:0:ok").unwrap();
        assert_eq!(coordinator.stats().malformed_frames, 1);
    }

    #[test]
    fn test_out_of_bounds_operation_rejected() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let a = join(&mut coordinator, "A");
        let mut b = join(&mut coordinator, "B");

        let err = coordinator.submit(&a.id, b"0:3:x").unwrap_err();
        assert_eq!(
            err,
            SubmitError::Rejected(ApplyError::PositionOutOfBounds { position: 3, len: 0 })
        );
        let err = coordinator.submit(&a.id, b"1:0:x").unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(_)));

        assert!(b.frames().is_empty());
        assert_eq!(coordinator.stats().operations_rejected, 2);
        assert!(coordinator.registry().contains(&a.id));
    }

    #[test]
    fn test_unknown_origin() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let err = coordinator
            .submit(&ClientId::from("nobody"), b"0:0:x")
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Session(SessionError::UnknownClient(ClientId::from("nobody")))
        );
    }

    #[test]
    fn test_failed_peers_removed_after_pass() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let a = join(&mut coordinator, "A");
        let gone = join(&mut coordinator, "gone");
        let mut ok = join(&mut coordinator, "ok");

        let (tx, _rx) = mpsc::channel(1);
        let slow = ClientId::from("slow");
        coordinator.join(slow.clone(), tx).unwrap();

        drop(gone.rx);
        coordinator.submit(&a.id, b"0:0:1").unwrap();
        // "slow" now has a full queue
        let applied = coordinator.submit(&a.id, b"0:1:2").unwrap();

        assert_eq!(applied.dropped, vec![slow.clone()]);
        assert!(!coordinator.registry().contains(&gone.id));
        assert!(!coordinator.registry().contains(&slow));
        assert!(coordinator.registry().contains(&ok.id));
        assert_eq!(ok.frames(), vec!["0:0:1".to_string(), "0:1:2".to_string()]);
        assert_eq!(coordinator.stats().peers_dropped, 2);
        assert_eq!(coordinator.document().text(), "12");
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let _a = join(&mut coordinator, "A");
        let (tx, _rx) = mpsc::channel(4);
        assert_eq!(
            coordinator.join(ClientId::from("A"), tx),
            Err(SessionError::DuplicateClient(ClientId::from("A")))
        );
        assert_eq!(coordinator.stats().active_sessions, 1);
    }

    #[test]
    fn test_leave_and_shutdown() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let (tx, _rx) = mpsc::channel(4);
        let handle = coordinator.join(ClientId::from("A"), tx).unwrap();
        let _b = join(&mut coordinator, "B");
        let _c = join(&mut coordinator, "C");

        assert!(coordinator.leave(&handle));
        assert!(!coordinator.leave(&handle));
        assert_eq!(coordinator.shutdown(), 2);
        assert!(coordinator.registry().is_empty());

        let stats = coordinator.stats();
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.active_sessions, 0);
    }

    #[test]
    fn test_stats_track_document() {
        let mut coordinator = BroadcastCoordinator::new(100);
        let a = join(&mut coordinator, "A");
        coordinator.submit(&a.id, b"0:0:abc").unwrap();
        coordinator.submit(&a.id, b"1:1:b").unwrap();

        let stats = coordinator.stats();
        assert_eq!(stats.operations_applied, 2);
        assert_eq!(stats.document_len, 2);
        assert_eq!(stats.document_version, 2);
    }
}

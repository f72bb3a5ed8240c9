//! Edit operations and their identity.
//!
//! Positions and lengths are measured in characters (Unicode scalar values),
//! never bytes, so that every replica agrees on offsets regardless of encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of edit. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    /// Splice `content` in at `position`
    Insert = 0,
    /// Remove `content.chars().count()` characters starting at `position`
    Delete = 1,
}

impl OpKind {
    /// Map a wire value back to a kind.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Insert),
            1 => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// Client identifier supplied at connection time.
///
/// Ordering is plain lexicographic string order. It doubles as the global
/// tie-break order for operations at identical positions, so it must never
/// depend on arrival order or on anything local to one replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Origin of an operation: which client sent it, and the server-assigned
/// receipt number for that client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub client_id: ClientId,
    /// Strictly increasing per client, assigned by the server at receipt
    pub sequence: u64,
}

impl OperationId {
    pub fn new(client_id: impl Into<ClientId>, sequence: u64) -> Self {
        Self {
            client_id: client_id.into(),
            sequence,
        }
    }
}

/// A single insert or delete against the shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Character offset in the origin's view of the document
    pub position: usize,
    pub content: String,
    pub id: OperationId,
}

impl Operation {
    pub fn insert(id: OperationId, position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Insert,
            position,
            content: content.into(),
            id,
        }
    }

    pub fn delete(id: OperationId, position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            content: content.into(),
            id,
        }
    }

    pub fn is_insert(&self) -> bool {
        self.kind == OpKind::Insert
    }

    pub fn is_delete(&self) -> bool {
        self.kind == OpKind::Delete
    }

    /// Length of `content` in characters.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Exclusive end of the affected range, in characters. Saturates at
    /// `usize::MAX`.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.len())
    }

    pub fn client_id(&self) -> &ClientId {
        &self.id.client_id
    }

    pub fn sequence(&self) -> u64 {
        self.id.sequence
    }

    /// Copy of this operation moved to `position`.
    pub fn with_position(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            OpKind::Insert => "insert",
            OpKind::Delete => "delete",
        };
        write!(
            f,
            "{verb} {:?} at {} ({}#{})",
            self.content, self.position, self.id.client_id, self.id.sequence
        )
    }
}

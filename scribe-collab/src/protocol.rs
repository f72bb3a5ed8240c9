//! Line protocol for edit operations.
//!
//! Wire format (UTF-8, one WebSocket frame per operation, both directions):
//! ```text
//! <op_type>:<position>:<content>
//!     │          │          └── inserted or deleted text, verbatim
//!     │          └── non-negative decimal character offset
//!     └── 0 = Insert, 1 = Delete
//! ```
//!
//! The delimiter is never escaped. A frame is split on every `:` and must have
//! exactly three fields, so content containing `:` cannot be expressed and is
//! rejected as malformed.
//!
//! The sequence number is not part of the wire format; the server assigns it
//! at receipt.

use scribe_core::{ClientId, OpKind, Operation, OperationId};

const DELIMITER: char = ':';

/// Decode a frame received from `origin`.
///
/// The returned operation carries sequence number 0 until the session
/// registry assigns the real one.
pub fn decode(bytes: &[u8], origin: &ClientId) -> Result<Operation, ProtocolError> {
    let line = std::str::from_utf8(bytes)
        .map_err(|e| ProtocolError::InvalidFormat(format!("not UTF-8: {e}")))?;

    let fields: Vec<&str> = line.split(DELIMITER).collect();
    if fields.len() != 3 {
        return Err(ProtocolError::InvalidFormat(format!(
            "expected 3 fields, got {}",
            fields.len()
        )));
    }

    let kind = fields[0]
        .parse::<u8>()
        .ok()
        .and_then(OpKind::from_wire)
        .ok_or_else(|| ProtocolError::InvalidOpType(fields[0].to_string()))?;

    let position = fields[1]
        .parse::<usize>()
        .map_err(|_| ProtocolError::InvalidPosition(fields[1].to_string()))?;

    Ok(Operation {
        kind,
        position,
        content: fields[2].to_string(),
        id: OperationId::new(origin.clone(), 0),
    })
}

/// Encode an operation for outbound delivery.
pub fn encode(op: &Operation) -> String {
    encode_fields(op.kind, op.position, &op.content)
}

/// Encode the full document as a single insert at offset 0, sent to a client
/// when it joins a non-empty document.
pub fn encode_snapshot(text: &str) -> String {
    encode_fields(OpKind::Insert, 0, text)
}

fn encode_fields(kind: OpKind, position: usize, content: &str) -> String {
    format!(
        "{}{DELIMITER}{position}{DELIMITER}{content}",
        kind.as_wire()
    )
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidFormat(String),
    InvalidOpType(String),
    InvalidPosition(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFormat(e) => write!(f, "Invalid message format: {e}"),
            Self::InvalidOpType(t) => write!(f, "Invalid operation type: {t:?}"),
            Self::InvalidPosition(p) => write!(f, "Invalid position: {p:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

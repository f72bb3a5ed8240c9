//! Operational transformation.
//!
//! `transform_pair(op1, op2)` re-expresses `op1` so that it can be applied to a
//! document on which `op2` has already been applied. Folding an operation
//! through a history with [`transform_against_history`] moves it from the
//! coordinates its origin saw into current document coordinates.
//!
//! Every function here is pure: inputs are borrowed and a fresh [`Operation`]
//! is returned, so one incoming operation can be transformed independently for
//! each peer without aliasing.
//!
//! Ties between concurrent inserts at the same position are broken by
//! ascending [`ClientId`](crate::ClientId), which is identical on every replica.
//!
//! Two operations from the same client are never concurrent: a client sends
//! its edits in order, each one produced with the previous ones applied. Such
//! a pair is left untouched in both directions.
//!
//! Position arithmetic saturates, so an operation with an absurd position
//! stays out of range and is rejected by [`Document::apply`](crate::Document::apply)
//! instead of wrapping around.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" (1989)

use crate::operation::{OpKind, Operation};

/// Transform `op` through every entry of `history`, oldest first.
pub fn transform_against_history<'a, I>(op: &Operation, history: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    history
        .into_iter()
        .fold(op.clone(), |current, past| transform_pair(&current, past))
}

/// Transform `op1` against a single operation `op2` that was applied first.
pub fn transform_pair(op1: &Operation, op2: &Operation) -> Operation {
    // Same origin: whichever is newer was generated with the other applied.
    if op1.client_id() == op2.client_id() {
        return op1.clone();
    }

    match op2.kind {
        OpKind::Insert => against_insert(op1, op2),
        OpKind::Delete => against_delete(op1, op2),
    }
}

fn against_insert(op1: &Operation, op2: &Operation) -> Operation {
    let keep = match op1.kind {
        OpKind::Insert => {
            op1.position < op2.position
                || (op1.position == op2.position && op1.client_id() < op2.client_id())
        }
        // A delete starting exactly at the insertion point must skip over the
        // inserted text, otherwise it would remove characters nobody targeted.
        OpKind::Delete => op1.position < op2.position,
    };

    if keep {
        op1.clone()
    } else {
        op1.with_position(op1.position.saturating_add(op2.len()))
    }
}

fn against_delete(op1: &Operation, op2: &Operation) -> Operation {
    match op1.kind {
        OpKind::Insert => {
            if op1.position <= op2.position {
                op1.clone()
            } else if op1.position < op2.end() {
                // The insertion point was inside the removed span.
                op1.with_position(op2.position)
            } else {
                op1.with_position(op1.position - op2.len())
            }
        }
        OpKind::Delete => delete_against_delete(op1, op2),
    }
}

fn delete_against_delete(op1: &Operation, op2: &Operation) -> Operation {
    let (start1, end1) = (op1.position, op1.end());
    let (start2, end2) = (op2.position, op2.end());

    if end1 <= start2 {
        return op1.clone();
    }
    if start1 >= end2 {
        return op1.with_position(start1 - (end2 - start2));
    }

    // Overlap: the intersection is already gone, delete only what is left.
    let chars: Vec<char> = op1.content.chars().collect();
    let cut_start = start2.saturating_sub(start1);
    let cut_end = end2.saturating_sub(start1).min(chars.len());
    let content: String = chars[..cut_start]
        .iter()
        .chain(chars[cut_end..].iter())
        .collect();

    log::trace!(
        "delete overlap: {op1} trimmed by {op2} to {:?} at {}",
        content,
        start1.min(start2)
    );

    Operation {
        kind: OpKind::Delete,
        position: start1.min(start2),
        content,
        id: op1.id.clone(),
    }
}

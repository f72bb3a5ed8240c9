//! # scribe-core — Operational transformation for plain text
//!
//! The pure half of Scribe: edit operations, the pairwise transform and its
//! fold over a history, the bounded history window, and the canonical
//! document that operations are applied to. Nothing in this crate performs
//! I/O or owns a task; the collaboration server in `scribe-collab` drives it.
//!
//! ## Modules
//!
//! - [`operation`] — `Operation`, `OperationId`, `ClientId`, `OpKind`
//! - [`transform`] — `transform_pair`, `transform_against_history`
//! - [`history`] — bounded FIFO of accepted operations per client
//! - [`document`] — character-addressed text with validated `apply`

pub mod operation;
pub mod transform;
pub mod history;
pub mod document;

pub use operation::{ClientId, OpKind, Operation, OperationId};
pub use transform::{transform_against_history, transform_pair};
pub use history::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY};
pub use document::{ApplyError, Document};

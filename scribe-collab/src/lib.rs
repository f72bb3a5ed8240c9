//! # scribe-collab — Real-time collaboration layer for Scribe
//!
//! Serves one shared plain-text document to many WebSocket clients and keeps
//! them consistent with operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ EditorClient │ ◄──────────────► │   OtServer   │
//! │ (per user)   │  "op:pos:text"   │  (central)   │
//! └──────────────┘                  └──────┬───────┘
//!                                          │ Command (mpsc)
//!                                          ▼
//!                               ┌──────────────────────┐
//!                               │ BroadcastCoordinator │
//!                               │  Document            │
//!                               │  SessionRegistry     │
//!                               └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Colon-delimited line codec
//! - [`session`] — Per-client history, sequence numbers and outbound queue
//! - [`broadcast`] — Transform, apply and per-peer fan-out
//! - [`server`] — WebSocket server and coordinator task
//! - [`client`] — WebSocket editor client

pub mod protocol;
pub mod session;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{decode, encode, ProtocolError};
pub use session::{ClientSession, SendError, SessionError, SessionHandle, SessionRegistry};
pub use broadcast::{Applied, BroadcastCoordinator, CoordinatorStats, SubmitError};
pub use server::{OtServer, ServerConfig, ServerHandle, ServerStats, CLIENT_ID_HEADER};
pub use client::{ClientError, ClientEvent, ConnectionState, EditorClient};

//! # quill-sync: Operational-transform replica synchronization
//!
//! Keeps many editors' copies of a plain-text document convergent through a
//! single authority per document that orders every edit into a gap-free log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ SyncClient   │ ◄──────────────► │ SyncServer   │
//! │ (per editor) │    JSON events   │ (central)    │
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ Replica      │                  │ Hub          │
//! │ Session      │                  │ (one task)   │
//! └──────────────┘                  └──────┬───────┘
//!                                          │
//!                                  ┌───────┴────────┐
//!                                  │ RoomRegistry   │
//!                                  │  └ Authority   │
//!                                  │    Session     │
//!                                  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: Operation engine trait and the plain-text implementation
//! - [`protocol`]: JSON wire events and update payloads
//! - [`authority`]: Authoritative document log and rebasing
//! - [`replica`]: Per-editor state machine (in flight, buffer, resync)
//! - [`registry`]: Document rooms and broadcast fan-out
//! - [`hub`]: Serializes connection events onto the registry
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`workload`]: Random word edits and the convergence check
//! - [`sim`]: Seeded in-process network simulation

pub mod error;
pub mod engine;
pub mod protocol;
pub mod authority;
pub mod replica;
pub mod registry;
pub mod hub;
pub mod server;
pub mod client;
pub mod workload;
pub mod sim;

// Re-exports for convenience
pub use error::SyncError;
pub use engine::{OperationEngine, Side, TextComponent, TextEngine, TextOp};
pub use protocol::{ClientUpdate, ConnectionId, DocId, ProtocolError, ServerBroadcast, Snapshot, WireEvent};
pub use authority::{AuthoritySession, Document};
pub use replica::ReplicaSession;
pub use registry::{Outbound, Outbox, RegistryStats, RoomRegistry};
pub use hub::{Hub, HubEvent, HubHandle, HubStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use workload::{check_convergence, ConvergenceReport, Scheduler, WorkloadConfig};
pub use sim::Simulation;

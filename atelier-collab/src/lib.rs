//! # atelier-collab — Real-time collaborative editing core
//!
//! Lets multiple users edit the same logical file concurrently and converge
//! on one consistent document, using optimistic version checks and a
//! three-tier conflict resolver instead of a central sequencer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │   Client    │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │    Binary Proto     │  (authority) │
//! └─────────────┘                     └──────┬───────┘
//!                                            │ ClientEvent
//!                                            ▼
//!                                    ┌────────────────┐
//!                                    │ SyncCoordinator│
//!                                    └──────┬─────────┘
//!                                           │
//!                              ┌────────────┴────────────┐
//!                              ▼                         ▼
//!                      ┌───────────────┐        ┌────────────────┐
//!                      │SessionRegistry│──────► │ConflictResolver│
//!                      │ (+ LockTable) │ merge  │  (3 tiers)     │
//!                      └───────────────┘        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded event/message enums)
//! - [`resolver`] — Three-tier conflict resolution (smart / semantic / manual)
//! - [`session`] — Session registry, advisory locks, bounded history
//! - [`coordinator`] — Event dispatch to routed outgoing messages
//! - [`broadcast`] — Per-session room fan-out with backpressure
//! - [`server`] — WebSocket server binding

pub mod broadcast;
pub mod coordinator;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{Frame, RoomManager, RoomStats, SessionRoom};
pub use coordinator::{ConnectionId, SyncCoordinator};
pub use protocol::{ClientEvent, CursorPosition, Outgoing, ProtocolError, ServerMessage};
pub use resolver::{
    ConflictKind, ConflictResolution, ConflictResolver, ConflictSection, FileCategory,
    MergeStrategy, ResolutionMetadata, ResolverError, SectionResolution, Severity,
    AUTO_RESOLVE_CONFIDENCE,
};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{
    CollaborationSession, HistoryEntry, LeaveOutcome, LockOutcome, LockState, LockTable,
    Operation, RegistryError, SessionId, SessionRegistry, UpdateOutcome,
};

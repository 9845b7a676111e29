//! # State synchronization
//!
//! Keeps three copies of the state in step:
//!
//! - memory: the [`EntityStateStore`](crate::state::EntityStateStore)
//! - disk: `models/*.sql` and `state/*.json` under the project directory
//!   ([`DiskReconciler`], driven by [`SyncService`])
//! - remote peers: patch batches and action envelopes over a [`Transport`]
//!   ([`RemoteLink`], [`RemoteHub`])
//!
//! Conflicts resolve last-write-wins per record.

pub mod conflict;
pub mod disk;
pub mod layout;
pub mod protocol;
pub mod remote;
pub mod service;
pub mod transport;

pub use conflict::{ConflictWinner, SyncConflict};
pub use disk::{fingerprint, DiskReconciler, TickReport};
pub use layout::{ProjectLayout, MODELS_DIR, STATE_DIR};
pub use protocol::{PatchBatch, WireMessage};
pub use remote::{LinkOptions, LinkReport, RemoteHub, RemoteLink};
pub use service::{SyncService, SyncStatus};
pub use transport::{duplex, ChannelTransport, LineTransport, Transport, WireSink, WireSource};

//! Broadcast channels for read-only engine state streams.

pub mod status;

pub use status::{FailureKind, SyncFailure, SyncStatus, SyncStatusBroadcaster};

//! Sync scheduling: jobs, producers, gatekeepers, controller, loop.

pub mod controller;
pub mod gatekeeper;
pub mod job;
pub mod producer;
pub mod scheduler;

pub use controller::{AdmitOutcome, NoopPriorityHook, PriorityHook, SyncController};
pub use gatekeeper::{CacheUsage, Gatekeeper};
pub use job::{JobKind, SyncJob};
pub use producer::JobProducer;
pub use scheduler::SyncScheduler;

//! Admission-control gatekeepers.
//!
//! A gatekeeper can veto a job without executing it. Gatekeepers must be
//! pure and independent: side-effect-free except for cheap reads of
//! already-cached state, so evaluation order never matters. A job is
//! admitted only if every registered gatekeeper allows it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::sync::job::SyncJob;

/// Admission predicate.
pub trait Gatekeeper: Send + Sync {
    fn name(&self) -> &'static str;
    fn allows(&self, job: &SyncJob) -> bool;
}

/// Cached total of content bytes (bodies + attachment files).
///
/// Refreshed from the store by the controller after completions so that
/// gatekeeper evaluation never touches the database.
#[derive(Default)]
pub struct CacheUsage {
    bytes: AtomicU64,
}

impl CacheUsage {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }
}

/// Vetoes network-dependent jobs while offline. Only `EvictFromCache`
/// passes.
pub struct NetworkGatekeeper {
    connectivity: Arc<ConnectivityMonitor>,
}

impl NetworkGatekeeper {
    pub fn new(connectivity: Arc<ConnectivityMonitor>) -> Self {
        Self { connectivity }
    }
}

impl Gatekeeper for NetworkGatekeeper {
    fn name(&self) -> &'static str {
        "network"
    }

    fn allows(&self, job: &SyncJob) -> bool {
        !job.requires_network() || self.connectivity.is_online()
    }
}

/// Vetoes proactive downloads once cached content crosses the soft cache
/// threshold. User-triggered jobs always pass: a user opening a message
/// must be served regardless of pressure.
pub struct CachePressureGatekeeper {
    usage: Arc<CacheUsage>,
    soft_limit_bytes: u64,
}

impl CachePressureGatekeeper {
    pub fn new(usage: Arc<CacheUsage>, config: &SyncConfig) -> Self {
        Self {
            usage,
            soft_limit_bytes: config.soft_limit_bytes(),
        }
    }
}

impl Gatekeeper for CachePressureGatekeeper {
    fn name(&self) -> &'static str {
        "cache_pressure"
    }

    fn allows(&self, job: &SyncJob) -> bool {
        !job.is_proactive() || self.usage.bytes() <= self.soft_limit_bytes
    }
}

/// Runs the full chain, returning the name of the first gatekeeper that
/// vetoed, or `None` when the job is admitted.
pub fn first_veto(gatekeepers: &[Box<dyn Gatekeeper>], job: &SyncJob) -> Option<&'static str> {
    gatekeepers
        .iter()
        .find(|g| !g.allows(job))
        .map(|g| g.name())
}

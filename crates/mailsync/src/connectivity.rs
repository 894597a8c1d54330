//! Hot connectivity state.
//!
//! The platform integration layer pushes state changes in; gatekeepers and
//! producers read the atomic flags without re-querying the OS per job.
//! Regaining connectivity fires a trigger so the scheduler can start a
//! cycle immediately.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Connectivity change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Continuously-updated connectivity flags.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    metered: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool, metered: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            online: AtomicBool::new(online),
            metered: AtomicBool::new(metered),
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// True on cellular or other metered links; gates `OnWifi` downloads.
    pub fn is_metered(&self) -> bool {
        self.metered.load(Ordering::Relaxed)
    }

    /// Pushes a connectivity change. Emits an event only on actual
    /// transitions.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::Relaxed);
        if was != online {
            log::info!("Connectivity changed: online={}", online);
            let event = if online {
                ConnectivityEvent::Online
            } else {
                ConnectivityEvent::Offline
            };
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }

    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::Relaxed);
    }

    /// Subscribes to connectivity transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true, false)
    }
}

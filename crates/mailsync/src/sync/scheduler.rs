//! Periodic scheduling loop.
//!
//! Drives the controller's producer cycle on an interval and supports
//! manual wake-up via a broadcast trigger (a user action was enqueued,
//! connectivity returned, a folder was opened).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::sync::controller::SyncController;

/// Periodic sync loop around [`SyncController::run_cycle`].
pub struct SyncScheduler {
    controller: Arc<SyncController>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new(controller: Arc<SyncController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the scheduling loop in a background thread.
    /// Accepts a trigger receiver for manual cycle requests.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to build scheduler runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::debug!("Manual sync cycle triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    if let Err(e) = controller.run_cycle() {
                        log::error!("Sync cycle failed: {}", e);
                    }
                    // Let the cycle's jobs settle before the next one so a
                    // shutdown never abandons half the queue mid-flight.
                    controller.wait_idle().await;
                }
            });
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

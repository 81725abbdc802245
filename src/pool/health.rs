//! Background health checking.

use super::PoolInner;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Periodically probes idle workers and restores the pool size.
pub(super) struct HealthChecker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthChecker {
    pub(super) fn start(pool: Arc<PoolInner>, interval: Duration) -> Option<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("pypool-health".into())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Health checker started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            pool.health_check();
                        }
                        // Stop requested, or the pool handle is gone.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Health checker stopped");
            });

        match handle {
            Ok(handle) => Some(Self { stop_tx, handle }),
            Err(e) => {
                warn!(error = %e, "Failed to start health checker; idle workers will not be probed");
                None
            }
        }
    }

    /// Signal the thread and wait for the current round to finish.
    pub(super) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Health checker thread panicked");
        }
    }
}

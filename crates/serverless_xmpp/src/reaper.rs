//! Idle reaper — closes streams that have gone quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Periodically closes and evicts streams idle longer than a threshold.
pub struct IdleReaper {
    registry: Arc<ConnectionRegistry>,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(registry: Arc<ConnectionRegistry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
        }
    }

    /// Run one sweep. Returns how many streams were reaped.
    pub fn sweep(&self) -> usize {
        let mut reaped = 0;
        for stream in self.registry.streams() {
            let idle = stream.idle_for();
            if idle <= self.idle_timeout {
                continue;
            }
            info!(
                "Reaping stream {} ({}) idle for {idle:?}",
                stream.id(),
                stream
                    .peer()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| stream.remote_addr().to_string())
            );
            stream.close_channel();
            self.registry.remove(&stream);
            reaped += 1;
        }
        reaped
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let reaped = self.sweep();
                        if reaped > 0 {
                            debug!("Idle sweep reaped {reaped} stream(s)");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Idle reaper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

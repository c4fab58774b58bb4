//! Connection draining for graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Tracks active connections and waits for them to finish during shutdown
pub struct ConnectionDrain {
    active: Arc<AtomicUsize>,
    max_drain_time: Duration,
}

/// RAII handle for one tracked connection; dropping it decrements the count
pub struct ActiveConnection {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ConnectionDrain {
    /// Create a drain tracker with the given grace period
    pub fn new(max_drain_time: Duration) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_drain_time,
        }
    }

    /// Register a new connection; hold the returned guard for its lifetime
    pub fn track(&self) -> ActiveConnection {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            active: Arc::clone(&self.active),
        }
    }

    /// Number of connections currently tracked
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait for active connections to finish.
    ///
    /// Returns `true` if everything drained within the grace period,
    /// `false` when the timeout was reached with connections still open.
    pub async fn wait_for_drain(&self) -> bool {
        let start = Instant::now();
        let initial = self.active.load(Ordering::Relaxed);

        if initial == 0 {
            return true;
        }

        info!(
            active_connections = initial,
            grace_secs = self.max_drain_time.as_secs(),
            "waiting for connections to drain"
        );

        while self.active.load(Ordering::Relaxed) > 0 {
            if start.elapsed() > self.max_drain_time {
                let remaining = self.active.load(Ordering::Relaxed);
                warn!(
                    remaining_connections = remaining,
                    elapsed_secs = start.elapsed().as_secs(),
                    "drain grace period reached with connections still open"
                );
                return false;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            "all connections drained"
        );
        true
    }
}

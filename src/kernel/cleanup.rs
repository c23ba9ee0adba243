//! Background cleanup for resource management.
//!
//! CleanupService provides periodic garbage collection of:
//! - Idle sessions (closed, which cancels anything they still run)
//! - Idle rate limit buckets
//!
//! This prevents unbounded growth of per-sender state in long-running
//! deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

use crate::kernel::Kernel;

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Number of idle sessions closed
    pub sessions_evicted: usize,
    /// Number of idle rate limit buckets dropped
    pub rate_buckets_evicted: usize,
    /// When cleanup cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// CleanupService handles background garbage collection.
#[derive(Debug)]
pub struct CleanupService {
    kernel: Arc<Kernel>,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CleanupService {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            stop_tx: None,
        }
    }

    /// Start the cleanup loop in the background.
    /// Returns immediately; cleanup runs in a spawned task until `stop` is
    /// called or the kernel shuts down.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let kernel = Arc::clone(&self.kernel);
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let period = kernel.config().runtime.cleanup_interval;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_cleanup_cycle(&kernel);
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("cleanup_service_stopped");
                        break;
                    }
                    _ = kernel.shutdown_token().cancelled() => {
                        tracing::debug!("cleanup_service_shutdown");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the cleanup loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cleanup cycle against the current configuration.
    pub fn run_cleanup_cycle(kernel: &Kernel) -> CleanupStats {
        let config = kernel.config();

        let sessions_evicted = kernel.sessions().evict_idle(config.session.idle_timeout);
        let rate_buckets_evicted = kernel
            .rate_limiter()
            .evict_idle(config.rate_limit.idle_eviction);

        if sessions_evicted > 0 || rate_buckets_evicted > 0 {
            tracing::debug!(sessions_evicted, rate_buckets_evicted, "cleanup_cycle_completed");
        }

        CleanupStats {
            sessions_evicted,
            rate_buckets_evicted,
            completed_at: Some(Utc::now()),
        }
    }
}

impl Drop for CleanupService {
    fn drop(&mut self) {
        self.stop();
    }
}

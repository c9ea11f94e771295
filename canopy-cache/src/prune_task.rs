//! Periodic expiry sweep.
//!
//! Expired entries are already invisible to readers; this task reclaims
//! their space so rows that are never read again do not accumulate in the
//! durable store.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = spawn_prune_task(cache.clone(), settings.prune_interval(), shutdown_rx);
//!
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{CacheStore, ResponseCache};

/// Shortest sweep interval; shorter requests, including zero, are raised to it.
pub const MIN_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Counters for the prune task.
#[derive(Debug, Default)]
pub struct PruneMetrics {
    /// Sweeps completed, successful or not
    pub cycles: AtomicU64,
    /// Entries removed across both tiers
    pub removed: AtomicU64,
    /// Sweeps that failed
    pub errors: AtomicU64,
}

impl PruneMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PruneSnapshot {
        PruneSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PruneMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneSnapshot {
    pub cycles: u64,
    pub removed: u64,
    pub errors: u64,
}

/// Spawn [`prune_task`] on the current runtime.
pub fn spawn_prune_task<S>(
    cache: Arc<ResponseCache<S>>,
    every: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Arc<PruneMetrics>>
where
    S: CacheStore + 'static,
{
    tokio::spawn(prune_task(cache, every, shutdown_rx))
}

/// Sweep expired entries every `every` until `shutdown_rx` reads `true`.
///
/// The first sweep runs immediately. `every` is raised to
/// [`MIN_PRUNE_INTERVAL`] if shorter.
pub async fn prune_task<S>(
    cache: Arc<ResponseCache<S>>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<PruneMetrics>
where
    S: CacheStore,
{
    let metrics = Arc::new(PruneMetrics::new());

    if every < MIN_PRUNE_INTERVAL {
        tracing::warn!(
            requested_ms = every.as_millis() as u64,
            "Prune interval too short, using minimum"
        );
    }
    let every = every.max(MIN_PRUNE_INTERVAL);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = every.as_millis() as u64, "Cache prune task started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache prune task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                prune_once(&cache, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        removed = snapshot.removed,
        errors = snapshot.errors,
        "Cache prune task completed"
    );

    metrics
}

async fn prune_once<S: CacheStore>(cache: &ResponseCache<S>, metrics: &PruneMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    match cache.prune_expired().await {
        Ok(report) if report.total() > 0 => {
            metrics.removed.fetch_add(report.total(), Ordering::Relaxed);
            tracing::info!(
                fast_removed = report.fast_removed,
                durable_removed = report.durable_removed,
                "Cache prune cycle completed"
            );
        }
        Ok(_) => tracing::trace!("Cache prune cycle found nothing to remove"),
        Err(e) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Cache prune cycle failed");
        }
    }
}

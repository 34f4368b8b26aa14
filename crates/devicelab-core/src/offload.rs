//! Bounded pool for blocking calls.
//!
//! The device collaborator is synchronous. Its calls are moved onto tokio's
//! blocking threads so they never stall the async scheduler, and a semaphore
//! caps how many run at once so a burst of device queries cannot exhaust the
//! blocking thread pool.
//!
//! The pool only accepts synchronous closures. There is no way to hand it a
//! future, so an already-async operation cannot be double-wrapped.
//!
//! # Example
//!
//! ```ignore
//! use devicelab_core::BlockingPool;
//!
//! let pool = BlockingPool::new(4);
//! let version = pool.run(move || device.product_version()).await?;
//! pool.shutdown();
//! ```

use crate::error::DeviceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

// ============================================================================
// Statistics
// ============================================================================

/// Pool statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Calls that were handed to a blocking thread.
    pub submitted: AtomicU64,
    /// Calls that returned normally.
    pub completed: AtomicU64,
    /// Calls whose worker panicked or was cancelled.
    pub lost: AtomicU64,
}

impl PoolStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Calls submitted but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.submitted()
            .saturating_sub(self.completed())
            .saturating_sub(self.lost())
    }
}

// ============================================================================
// Pool Implementation
// ============================================================================

/// Runs synchronous closures on blocking threads, at most `size` at a time.
///
/// Cheap to clone; clones share the same limit and statistics.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
    stats: Arc<PoolStats>,
}

impl BlockingPool {
    /// Create a pool allowing `size` concurrent calls (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        tracing::debug!(size, "Creating blocking pool");
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Run `f` on a blocking thread and await its result.
    ///
    /// Waits for a free slot first. The slot is held until `f` returns, even
    /// if the returned future is dropped early.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Offload`] if the pool was shut down or the closure
    /// panicked.
    pub async fn run<F, T>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DeviceError::Offload("blocking pool is shut down".into()))?;

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::task::spawn_blocking(move || {
            // Hold the slot until the call returns
            let _permit = permit;
            f()
        });

        match handle.await {
            Ok(value) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                self.stats.lost.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Blocking call failed");
                Err(DeviceError::Offload(e.to_string()))
            }
        }
    }

    /// Run a fallible closure, flattening its error into the result.
    pub async fn try_run<F, T>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        self.run(f).await?
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently in use.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    /// Stop accepting calls. Calls already running are left to finish.
    pub fn shutdown(&self) {
        self.permits.close();
        tracing::info!(
            submitted = self.stats.submitted(),
            completed = self.stats.completed(),
            lost = self.stats.lost(),
            "Blocking pool shut down"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

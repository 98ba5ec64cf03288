//! Bounded worker pool for channel-level work
//!
//! Channels own disjoint buffers, so per-channel updates are dispatched as
//! an independent map. With an effective worker count of zero everything
//! runs on the calling thread.

use rayon::prelude::*;

use crate::error::{MtvError, Result};

/// Hard ceiling on worker threads
pub const MAX_WORKERS: usize = 8;

pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.workers).finish()
    }
}

impl WorkerPool {
    /// Worker count actually used for `requested` workers over `n_channels`
    pub fn effective_workers(requested: usize, n_channels: usize) -> usize {
        requested.min(n_channels).min(MAX_WORKERS)
    }

    pub fn new(requested: usize, n_channels: usize) -> Result<Self> {
        let workers = Self::effective_workers(requested, n_channels);
        let pool = if workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| MtvError::Pool(format!("failed to build thread pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { pool, workers })
    }

    /// Pool that runs everything on the caller thread
    pub fn sequential() -> Self {
        Self { pool: None, workers: 0 }
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `f` to every item with its index, in parallel when workers are
    /// available. Results keep the item order.
    pub fn map_mut<T, R, F>(&self, items: &mut [T], f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, &mut T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| {
                items
                    .par_iter_mut()
                    .enumerate()
                    .map(|(i, t)| f(i, t))
                    .collect()
            }),
            None => items.iter_mut().enumerate().map(|(i, t)| f(i, t)).collect(),
        }
    }

    /// Read-only variant of [`WorkerPool::map_mut`]
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| items.par_iter().enumerate().map(|(i, t)| f(i, t)).collect()),
            None => items.iter().enumerate().map(|(i, t)| f(i, t)).collect(),
        }
    }
}

/// Collect per-item results, failing on the first error
pub fn collect_results<R>(results: Vec<Result<R>>) -> Result<Vec<R>> {
    results.into_iter().collect()
}

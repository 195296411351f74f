//! Fixed-size worker pool for blocking metadata loads.

use crate::error::MetaError;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Bounded pool that runs a batch of closures and returns once all of them finish.
///
/// At most `parallelism` closures run at once, which caps the open files and network
/// connections a rebalance or a query fan-out can hold.
#[derive(Debug)]
pub struct WorkerPool {
    pool: ThreadPool,
    parallelism: usize,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Result<Self, MetaError> {
        if parallelism == 0 {
            return Err(MetaError::ConfigError(
                "worker pool parallelism must be at least 1".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("segmeta-worker-{}", i))
            .build()
            .map_err(|e| MetaError::BackgroundTaskError(format!("failed to build worker pool: {}", e)))?;
        Ok(Self { pool, parallelism })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Applies `f` to every item on the pool and returns results in input order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Send + Sync,
    {
        self.pool.install(|| items.par_iter().map(f).collect())
    }

    /// Runs every task on the pool and waits for all of them.
    pub fn run_all<F>(&self, tasks: Vec<F>)
    where
        F: FnOnce() + Send,
    {
        self.pool
            .install(|| tasks.into_par_iter().for_each(|task| task()));
    }
}

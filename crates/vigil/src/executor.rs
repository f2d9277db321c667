//! Task scheduling for the embarrassingly parallel part of each stage.
//!
//! Stages hand an executor a number of independent jobs (one per match key).
//! Jobs return `Err` to abort the batch: the executor stops scheduling new
//! jobs and returns the first error it observed.

use crate::Error;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

pub trait Executor: Send + Sync {
    fn execute(&self, jobs: usize, job: &(dyn Fn(usize) -> Result<(), Error> + Sync)) -> Result<(), Error>;
}

/// Run every job on the calling thread, in order
#[derive(Default, Clone, Copy)]
pub struct SerialExecutor;

impl Executor for SerialExecutor {
    fn execute(&self, jobs: usize, job: &(dyn Fn(usize) -> Result<(), Error> + Sync)) -> Result<(), Error> {
        (0..jobs).try_for_each(job)
    }
}

/// Bounded rayon pool owned by the executor, so that the engine does not
/// compete with the caller's global pool
pub struct ThreadPoolExecutor {
    pool: ThreadPool,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|ix| format!("vigil-worker-{}", ix))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("unable to build worker pool: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, jobs: usize, job: &(dyn Fn(usize) -> Result<(), Error> + Sync)) -> Result<(), Error> {
        self.pool
            .install(|| (0..jobs).into_par_iter().try_for_each(job))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sum_with(executor: &dyn Executor) -> usize {
        let total = AtomicUsize::new(0);
        executor
            .execute(100, &|ix| {
                total.fetch_add(ix, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        total.into_inner()
    }

    #[test]
    fn executors_agree() {
        assert_eq!(sum_with(&SerialExecutor), 4950);
        assert_eq!(sum_with(&ThreadPoolExecutor::new(4).unwrap()), 4950);
    }

    #[test]
    fn first_error_stops_serial_batch() {
        let seen = AtomicUsize::new(0);
        let res = SerialExecutor.execute(10, &|ix| {
            seen.fetch_add(1, Ordering::Relaxed);
            if ix == 3 {
                Err(Error::Canceled("test"))
            } else {
                Ok(())
            }
        });
        assert!(matches!(res, Err(Error::Canceled("test"))));
        assert_eq!(seen.into_inner(), 4);
    }
}

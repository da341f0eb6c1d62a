/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Runs a function over a sequence, serially or on a bounded thread pool

use anyhow::{Context, Result};
use itertools::Either;
use rayon::prelude::*;

use crate::errors::InvalidConfigurationError;

/// Uniform "apply this function to every item" abstraction.
///
/// With one job, items are processed lazily on the calling thread, in order.
/// With more, they are processed by a dedicated [`rayon::ThreadPool`] of
/// `jobs` threads, each taking at least `chunksize` items at a time; the
/// pool's threads are released when the `WorkerPool` is dropped.
///
/// ```
/// use tinymr::pool::WorkerPool;
///
/// let pool = WorkerPool::new(4, 2, true).unwrap();
/// let mut squares = pool
///     .run(0..10u64, |i| Ok(i * i))
///     .collect::<anyhow::Result<Vec<_>>>()
///     .unwrap();
/// squares.sort();
/// assert_eq!(squares[9], 81);
/// ```
pub struct WorkerPool {
    jobs: usize,
    chunksize: usize,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("jobs", &self.jobs)
            .field("chunksize", &self.chunksize)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(jobs: usize, chunksize: usize, threaded: bool) -> Result<Self> {
        if jobs == 0 {
            return Err(InvalidConfigurationError::NonPositive {
                name: "jobs",
                value: jobs,
            }
            .into());
        }
        if chunksize == 0 {
            return Err(InvalidConfigurationError::NonPositive {
                name: "chunksize",
                value: chunksize,
            }
            .into());
        }
        if jobs > 1 && !threaded {
            return Err(InvalidConfigurationError::UnsupportedPoolMode { jobs }.into());
        }
        let pool = if jobs > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .thread_name(|i| format!("tinymr-worker-{i}"))
                    .build()
                    .context("Could not build thread pool")?,
            )
        } else {
            None
        };
        Ok(WorkerPool {
            jobs,
            chunksize,
            pool,
        })
    }

    /// A pool running everything on the calling thread
    pub fn serial() -> Self {
        WorkerPool {
            jobs: 1,
            chunksize: 1,
            pool: None,
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    pub fn is_serial(&self) -> bool {
        self.pool.is_none()
    }

    /// Applies `f` to every item.
    ///
    /// Results come in the order of `items`. Serial pools return a lazy
    /// iterator. Parallel pools process all items before returning; the first
    /// error aborts the remaining work and is the only item yielded.
    pub fn run<T, R, F>(
        &self,
        items: impl IntoIterator<Item = T>,
        f: F,
    ) -> impl Iterator<Item = Result<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Send + Sync,
    {
        match &self.pool {
            None => Either::Left(items.into_iter().map(f)),
            Some(pool) => {
                let items: Vec<T> = items.into_iter().collect();
                let chunksize = self.chunksize;
                let results = pool.install(|| {
                    items
                        .into_par_iter()
                        .with_min_len(chunksize)
                        .map(&f)
                        .collect::<Result<Vec<R>>>()
                });
                let results: Vec<Result<R>> = match results {
                    Ok(results) => results.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                Either::Right(results.into_iter())
            }
        }
    }
}

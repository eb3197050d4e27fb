use anyhow::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;

/// A fixed set of worker threads.
///
/// A single worker runs on the calling thread.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    pool: Option<ThreadPool>,
    threads: usize,
}

impl WorkerPool {
    /// Creates a pool of `threads` workers, or as many as rayon's global pool if `threads` is 0.
    pub(crate) fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            rayon::current_num_threads()
        } else {
            threads
        };
        let pool = if threads > 1 {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("nanotrain-worker-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self { pool, threads })
    }
    pub(crate) fn threads(&self) -> usize {
        self.threads
    }
    /// Runs `f(thread_id, threads)` once on every worker and blocks until all return.
    pub(crate) fn broadcast<F>(&self, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        if let Some(pool) = self.pool.as_ref() {
            pool.broadcast(|context| f(context.index(), context.num_threads()));
        } else {
            f(0, 1);
        }
    }
}

/// The contiguous range of `len` items handled by `thread_id`.
pub(crate) fn chunk(len: usize, thread_id: usize, threads: usize) -> Range<usize> {
    let start = len * thread_id / threads;
    let end = len * (thread_id + 1) / threads;
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn chunks_cover_range() {
        for len in [0, 1, 5, 17] {
            for threads in 1..6 {
                let ranges: Vec<_> = (0..threads).map(|t| chunk(len, t, threads)).collect();
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges[threads - 1].end, len);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
            }
        }
    }

    #[test]
    fn broadcast_runs_every_worker() {
        for threads in [1, 3] {
            let pool = WorkerPool::new(threads).unwrap();
            assert_eq!(pool.threads(), threads);
            let seen = Mutex::new(vec![0; threads]);
            pool.broadcast(|thread_id, n| {
                assert_eq!(n, threads);
                seen.lock()[thread_id] += 1;
            });
            assert_eq!(seen.into_inner(), vec![1; threads]);
        }
    }
}

//! Fork-join dispatch with static partitioning.

use rayon::{ThreadPool as RayonPool, ThreadPoolBuilder};
use snipjit_platform::cpu_count;
use tracing::debug;

use super::domain::unravel;
use crate::env;
use crate::error::RuntimeError;

/// Balanced split of `n` work items over `team` workers: the first
/// `n % team` workers get one item more. Returns `[start, end)` of `tid`.
pub fn splitter(n: usize, team: usize, tid: usize) -> (usize, usize) {
    if team <= 1 || n == 0 {
        return if tid == 0 { (0, n) } else { (n, n) };
    }
    let n1 = n.div_ceil(team);
    let n2 = n1 - 1;
    let t1 = n - n2 * team;
    let count = if tid < t1 { n1 } else { n2 };
    let start = if tid <= t1 {
        tid * n1
    } else {
        t1 * n1 + (tid - t1) * n2
    };
    (start.min(n), (start + count).min(n))
}

/// Raw pointer handed to worker jobs. The executor guarantees that workers
/// touch disjoint memory through it.
#[derive(Debug, Clone, Copy)]
pub struct SyncPtr<T>(pub *mut T);

unsafe impl<T> Send for SyncPtr<T> {}
unsafe impl<T> Sync for SyncPtr<T> {}

impl<T> SyncPtr<T> {
    pub fn get(self) -> *mut T {
        self.0
    }
}

/// Worker pool the executor dispatches units on.
#[derive(Debug)]
pub struct ThreadPool {
    pool: RayonPool,
    threads: usize,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Result<Self, RuntimeError> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("snipjit-worker-{}", i))
            .build()
            .map_err(|e| RuntimeError::ThreadPool(e.to_string()))?;
        debug!(threads, "thread pool created");
        Ok(Self { pool, threads })
    }

    /// Pool sized by `SNIPJIT_THREADS`, or one worker per CPU.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(env::thread_count().unwrap_or_else(cpu_count))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `job(ithr, nthr, state)` once per element of `states`, each job
    /// owning its state exclusively, and wait for all of them.
    pub fn run_with_state<S, F>(&self, states: &mut [S], job: F)
    where
        S: Send,
        F: Fn(usize, usize, &mut S) + Sync,
    {
        let nthr = states.len();
        if nthr == 1 {
            job(0, 1, &mut states[0]);
            return;
        }
        let job = &job;
        self.pool.scope(|scope| {
            for (ithr, state) in states.iter_mut().enumerate() {
                scope.spawn(move |_| job(ithr, nthr, state));
            }
        });
    }

    /// Run `job(ithr, nthr)` on `nthr` workers.
    pub fn run_workers<F>(&self, nthr: usize, job: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        let mut states = vec![(); nthr.max(1)];
        self.run_with_state(&mut states, |ithr, nthr, _| job(ithr, nthr));
    }

    /// Call `f(ithr, index)` for every point of a 1 to 6 dimensional
    /// `domain`, splitting it statically across the workers.
    pub fn parallel_for<F>(&self, domain: &[usize], f: F)
    where
        F: Fn(usize, &[usize]) + Sync,
    {
        let total: usize = domain.iter().product();
        let nthr = self.threads.min(total).max(1);
        self.run_workers(nthr, |ithr, nthr| {
            let (start, end) = splitter(total, nthr, ithr);
            let mut index = [0usize; 6];
            let index = &mut index[..domain.len().min(6)];
            for unit in start..end {
                unravel(unit, domain, index);
                f(ithr, index);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_splitter_balances() {
        let parts: Vec<(usize, usize)> = (0..3).map(|t| splitter(5, 3, t)).collect();
        assert_eq!(parts, vec![(0, 2), (2, 4), (4, 5)]);
        let parts: Vec<(usize, usize)> = (0..4).map(|t| splitter(2, 4, t)).collect();
        assert_eq!(parts, vec![(0, 1), (1, 2), (2, 2), (2, 2)]);
        assert_eq!(splitter(0, 4, 0), (0, 0));
        assert_eq!(splitter(7, 1, 0), (0, 7));
    }

    #[test]
    fn test_splitter_covers_range() {
        for n in 0..20 {
            for team in 1..6 {
                let mut next = 0;
                for tid in 0..team {
                    let (start, end) = splitter(n, team, tid);
                    assert_eq!(start, next);
                    next = end;
                }
                assert_eq!(next, n);
            }
        }
    }

    #[test]
    fn test_parallel_for_visits_every_point() {
        let pool = ThreadPool::new(3).unwrap();
        let sum = AtomicUsize::new(0);
        let count = AtomicUsize::new(0);
        pool.parallel_for(&[2, 3, 4], |_, idx| {
            sum.fetch_add(idx[0] * 12 + idx[1] * 4 + idx[2], Ordering::Relaxed);
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 24);
        assert_eq!(sum.load(Ordering::Relaxed), (0..24).sum());
    }

    #[test]
    fn test_states_are_per_worker() {
        let pool = ThreadPool::new(4).unwrap();
        let mut states = vec![0usize; 4];
        pool.run_with_state(&mut states, |ithr, nthr, state| {
            assert_eq!(nthr, 4);
            *state = ithr + 1;
        });
        assert_eq!(states, vec![1, 2, 3, 4]);
    }
}

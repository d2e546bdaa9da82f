/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Bounded pools of reusable, stateful workers keyed by a resource.
//!
//! Each key owns a small deque of idle workers. [`WorkerPool::obtain`] pops
//! an idle worker, creates a new one while fewer than `size` exist for that
//! key, and otherwise blocks until another caller releases one. There is no
//! timeout: the returned [`PooledWorker`] guard releases on drop, so every
//! exit path of the caller gives the worker back.
//!
//! Keys that stay idle for longer than the configured TTL are discarded the
//! next time the pool is used; their workers are rebuilt on demand.

use crate::error::PackagingError;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_POOL_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Environment variable overriding [`DEFAULT_POOL_SIZE`].
pub const POOL_SIZE_ENV: &str = "APKZIP_WORKER_POOL_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of workers alive per key.
    pub size: usize,
    /// How long an unused key keeps its workers.
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            ttl: DEFAULT_POOL_TTL,
        }
    }
}

impl PoolConfig {
    pub fn with_size(size: usize) -> Self {
        Self {
            size: size.max(1),
            ..Self::default()
        }
    }

    /// Defaults, with the size taken from `APKZIP_WORKER_POOL_SIZE` when set.
    pub fn from_env() -> Self {
        Self::from_size_var(std::env::var(POOL_SIZE_ENV).ok().as_deref())
    }

    /// Defaults, with the size parsed from `value`. Unset, unparsable and
    /// zero values keep [`DEFAULT_POOL_SIZE`].
    pub fn from_size_var(value: Option<&str>) -> Self {
        match value.and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(size) if size > 0 => Self::with_size(size),
            _ => Self::default(),
        }
    }
}

type Factory<K, W> = dyn Fn(&K) -> Result<W, PackagingError> + Send + Sync;

struct SlotState<W> {
    idle: VecDeque<W>,
    alive: usize,
    last_used: Instant,
}

struct Slot<W> {
    state: Mutex<SlotState<W>>,
    available: Condvar,
}

impl<W> Slot<W> {
    fn lock(&self) -> MutexGuard<'_, SlotState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool<K, W> {
    config: PoolConfig,
    factory: Box<Factory<K, W>>,
    slots: Mutex<HashMap<K, Arc<Slot<W>>>>,
}

impl<K, W> WorkerPool<K, W>
where
    K: Eq + Hash + Clone,
{
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn(&K) -> Result<W, PackagingError> + Send + Sync + 'static,
    {
        Self {
            config: PoolConfig {
                size: config.size.max(1),
                ttl: config.ttl,
            },
            factory: Box::new(factory),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Check out a worker for `key`, blocking while all of its workers are busy.
    pub fn obtain(&self, key: &K) -> Result<PooledWorker<W>, PackagingError> {
        let slot = self.slot_for(key);

        let mut state = slot.lock();
        loop {
            if let Some(worker) = state.idle.pop_front() {
                state.last_used = Instant::now();
                drop(state);
                return Ok(PooledWorker::new(slot, worker));
            }
            if state.alive < self.config.size {
                state.alive += 1;
                drop(state);
                return match (self.factory)(key) {
                    Ok(worker) => {
                        trace!("worker pool: created worker");
                        Ok(PooledWorker::new(slot, worker))
                    }
                    Err(e) => {
                        let mut state = slot.lock();
                        state.alive -= 1;
                        slot.available.notify_one();
                        Err(e)
                    }
                };
            }
            state = slot
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of workers for `key` currently checked out.
    pub fn checked_out(&self, key: &K) -> usize {
        self.with_slot(key, |s| s.alive - s.idle.len())
    }

    /// Number of idle workers waiting in the pool for `key`.
    pub fn idle(&self, key: &K) -> usize {
        self.with_slot(key, |s| s.idle.len())
    }

    /// Drop every key whose workers have been idle for longer than the TTL.
    pub fn evict_expired(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_expired_locked(&mut slots);
    }

    fn with_slot<T: Default>(&self, key: &K, f: impl FnOnce(&SlotState<W>) -> T) -> T {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(key).cloned()
        };
        match slot {
            Some(slot) => {
                let state = slot.lock();
                f(&state)
            }
            None => T::default(),
        }
    }

    fn slot_for(&self, key: &K) -> Arc<Slot<W>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_expired_locked(&mut slots);
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
            debug!("worker pool: new pool (size {})", self.config.size);
            Arc::new(Slot {
                state: Mutex::new(SlotState {
                    idle: VecDeque::with_capacity(self.config.size),
                    alive: 0,
                    last_used: Instant::now(),
                }),
                available: Condvar::new(),
            })
        }))
    }

    fn evict_expired_locked(&self, slots: &mut HashMap<K, Arc<Slot<W>>>) {
        let ttl = self.config.ttl;
        slots.retain(|_, slot| {
            // Anyone else holding the slot is using it or waiting on it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let state = slot.lock();
            let keep = state.alive > state.idle.len() || state.last_used.elapsed() < ttl;
            if !keep {
                debug!("worker pool: expiring {} idle worker(s)", state.idle.len());
            }
            keep
        });
    }
}

/// A worker checked out of a [`WorkerPool`]; returned to the pool on drop.
pub struct PooledWorker<W> {
    slot: Arc<Slot<W>>,
    worker: Option<W>,
}

impl<W> PooledWorker<W> {
    fn new(slot: Arc<Slot<W>>, worker: W) -> Self {
        Self {
            slot,
            worker: Some(worker),
        }
    }

    /// Return the worker to its pool now.
    pub fn release(self) {}

    /// Take the worker out of the pool for good, freeing its place for a new one.
    pub fn discard(mut self) -> W {
        let worker = self.worker.take();
        let mut state = self.slot.lock();
        state.alive -= 1;
        self.slot.available.notify_one();
        drop(state);
        match worker {
            Some(w) => w,
            None => unreachable!("pooled worker taken twice"),
        }
    }
}

impl<W> Deref for PooledWorker<W> {
    type Target = W;

    fn deref(&self) -> &W {
        match &self.worker {
            Some(w) => w,
            None => unreachable!("pooled worker used after release"),
        }
    }
}

impl<W> DerefMut for PooledWorker<W> {
    fn deref_mut(&mut self) -> &mut W {
        match &mut self.worker {
            Some(w) => w,
            None => unreachable!("pooled worker used after release"),
        }
    }
}

impl<W> Drop for PooledWorker<W> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let mut state = self.slot.lock();
            state.idle.push_back(worker);
            state.last_used = Instant::now();
            self.slot.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn counting_pool(config: PoolConfig) -> (WorkerPool<String, usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = WorkerPool::new(config, move |_key: &String| {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });
        (pool, created)
    }

    #[test]
    fn reuses_released_workers() {
        let (pool, created) = counting_pool(PoolConfig::with_size(2));
        let key = "dx.jar".to_string();
        for _ in 0..10 {
            let w = pool.obtain(&key).unwrap();
            w.release();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(&key), 1);
    }

    #[test]
    fn full_pool_does_not_block_after_release() {
        let (pool, created) = counting_pool(PoolConfig::with_size(3));
        let key = "k".to_string();
        let workers: Vec<_> = (0..3).map(|_| pool.obtain(&key).unwrap()).collect();
        assert_eq!(pool.checked_out(&key), 3);
        drop(workers);
        assert_eq!(pool.checked_out(&key), 0);
        let again = pool.obtain(&key).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        drop(again);
    }

    #[test]
    fn keys_are_independent() {
        let (pool, _) = counting_pool(PoolConfig::with_size(1));
        let a = pool.obtain(&"a".to_string()).unwrap();
        let b = pool.obtain(&"b".to_string()).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn exhausted_pool_blocks_until_release() {
        let (pool, _) = counting_pool(PoolConfig::with_size(1));
        let pool = Arc::new(pool);
        let key = "k".to_string();
        let held = pool.obtain(&key).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = Arc::clone(&pool);
            let key = key.clone();
            std::thread::spawn(move || {
                let w = pool.obtain(&key).unwrap();
                tx.send(*w).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        let id = *held;
        drop(held);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), id);
        waiter.join().unwrap();
    }

    #[test]
    fn never_exceeds_pool_size() {
        let (pool, created) = counting_pool(PoolConfig::with_size(3));
        let pool = Arc::new(pool);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let w = pool.obtain(&"k".to_string()).unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(200));
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        drop(w);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(created.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn idle_keys_expire_and_rebuild() {
        let config = PoolConfig {
            size: 2,
            ttl: Duration::from_millis(20),
        };
        let (pool, created) = counting_pool(config);
        let key = "k".to_string();
        drop(pool.obtain(&key).unwrap());
        std::thread::sleep(Duration::from_millis(60));
        pool.evict_expired();
        assert_eq!(pool.idle(&key), 0);
        drop(pool.obtain(&key).unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_creation_frees_the_place() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool: WorkerPool<u32, u32> = WorkerPool::new(PoolConfig::with_size(1), move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PackagingError::Config("first build fails".into()))
            } else {
                Ok(7)
            }
        });
        assert!(pool.obtain(&1).is_err());
        assert_eq!(*pool.obtain(&1).unwrap(), 7);
    }

    #[test]
    fn size_comes_from_the_environment_value() {
        assert_eq!(PoolConfig::from_size_var(None).size, 4);
        assert_eq!(PoolConfig::from_size_var(Some("9")).size, 9);
        assert_eq!(PoolConfig::from_size_var(Some(" 2 ")).size, 2);
        assert_eq!(PoolConfig::from_size_var(Some("0")).size, DEFAULT_POOL_SIZE);
        assert_eq!(PoolConfig::from_size_var(Some("many")).size, DEFAULT_POOL_SIZE);
        assert_eq!(PoolConfig::from_size_var(Some("9")).ttl, DEFAULT_POOL_TTL);

        let current = std::env::var(POOL_SIZE_ENV).ok();
        assert_eq!(
            PoolConfig::from_env(),
            PoolConfig::from_size_var(current.as_deref())
        );
    }

    #[test]
    fn discarded_worker_is_replaced() {
        let (pool, created) = counting_pool(PoolConfig::with_size(1));
        let key = "k".to_string();
        let w = pool.obtain(&key).unwrap();
        assert_eq!(w.discard(), 0);
        assert_eq!(*pool.obtain(&key).unwrap(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}

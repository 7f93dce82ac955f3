//! TTL event cache.
//!
//! A thread-safe deduplication primitive keyed by an opaque event identifier.
//! One primitive serves two lifecycles:
//!
//! - **Debounce on arrival** ([`EventCache::try_add`]): the first caller within a
//!   TTL window wins, later callers are rejected until the window expires.
//! - **In-progress exclusion with cooldown** ([`EventCache::try_start`]): the
//!   winner holds an [`InProgress`] token. While held, the entry can never
//!   expire. Finishing (or dropping) the token starts a fresh TTL window
//!   measured from the finish instant.
//!
//! At most one live winner exists per identifier at any instant. An unseen or
//! expired identifier always succeeds, except after [`EventCache::stop`], when
//! every call fails closed.
//!
//! # Storage
//!
//! A map from identifier to slot, plus a queue of `(identifier, expiry)` records
//! in expiry order. Because the TTL is fixed and time is monotonic, records are
//! appended in non-decreasing expiry order and pruning only ever pops from the
//! front, stopping at the first unexpired record. A record whose expiry no
//! longer matches its map slot (the slot was re-armed or is in progress) is
//! discarded without touching the map.
//!
//! One mutex guards both structures. It is never held across an await point.
//! The clock is read while the mutex is held, so records are pushed in lock
//! order and their expiries never go backwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Floor for the background eviction tick.
const MIN_EVICTION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("eviction task did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("eviction task failed: {0}")]
    EvictionTaskFailed(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long an identifier stays claimed after `try_add` or after finishing.
    pub ttl: Duration,

    /// Tick of the background eviction task.
    pub eviction_interval: Duration,
}

impl CacheConfig {
    /// Creates a config with the default eviction tick of `max(ttl / 4, 1s)`.
    pub fn new(ttl: Duration) -> Self {
        CacheConfig {
            ttl,
            eviction_interval: (ttl / 4).max(MIN_EVICTION_INTERVAL),
        }
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Claimed by a live `InProgress` token. Never expires.
    InProgress,
    ExpiresAt(Instant),
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    order: VecDeque<(String, Instant)>,
    stopped: bool,
}

impl CacheState {
    /// Pops expired records from the front of the queue.
    fn prune(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, expiry)) = self.order.front() {
            if *expiry > now {
                break;
            }
            let Some((id, expiry)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&id) == Some(&Slot::ExpiresAt(expiry)) {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Returns true if `id` currently has a live claim.
    fn is_claimed(&self, id: &str, now: Instant) -> bool {
        match self.entries.get(id) {
            Some(Slot::InProgress) => true,
            Some(Slot::ExpiresAt(at)) => *at > now,
            None => false,
        }
    }

    fn arm(&mut self, id: &str, expiry: Instant) {
        self.entries.insert(id.to_string(), Slot::ExpiresAt(expiry));
        self.order.push_back((id.to_string(), expiry));
    }
}

#[derive(Debug)]
struct Shared {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Every critical section leaves the state consistent, so a panic in
        // another holder does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Cache ────────────────────────────────────────────────────────────────────

/// The deduplicating TTL cache.
///
/// Must be created inside a Tokio runtime: construction spawns the eviction
/// task. Dropping the cache cancels that task.
#[derive(Debug)]
pub struct EventCache {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventCache {
    pub fn new(config: CacheConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(CacheState::default()),
        });
        let cancel = CancellationToken::new();
        let first_tick = Instant::now() + config.eviction_interval;
        let task = tokio::spawn(run_eviction(shared.clone(), cancel.clone(), first_tick));

        EventCache {
            shared,
            cancel,
            eviction_task: Mutex::new(Some(task)),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.shared.config
    }

    /// Claims `id` for one TTL window.
    ///
    /// Returns true if there was no live claim on `id`. On a hit against a
    /// stale entry the queue is pruned before the entry is re-armed.
    pub fn try_add(&self, id: &str) -> bool {
        let mut state = self.shared.lock();
        let now = Instant::now();
        if state.stopped || state.is_claimed(id, now) {
            return false;
        }
        if state.entries.contains_key(id) {
            state.prune(now);
        }
        state.arm(id, now + self.shared.config.ttl);
        true
    }

    /// Claims `id` until the returned token is finished or dropped.
    ///
    /// Returns `None` if `id` is in progress, still cooling down, or the cache
    /// is stopped.
    pub fn try_start(&self, id: &str) -> Option<InProgress> {
        let mut state = self.shared.lock();
        let now = Instant::now();
        if state.stopped || state.is_claimed(id, now) {
            return None;
        }
        if state.entries.contains_key(id) {
            state.prune(now);
        }
        state.entries.insert(id.to_string(), Slot::InProgress);

        Some(InProgress {
            shared: self.shared.clone(),
            id: id.to_string(),
            finished: false,
        })
    }

    /// Drops the debounce window on `id`, so the next caller wins.
    ///
    /// In-progress entries are left alone; only their token releases them.
    /// Returns true if a window was dropped.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.shared.lock();
        match state.entries.get(id) {
            Some(Slot::ExpiresAt(_)) => {
                state.entries.remove(id);
                true
            }
            Some(Slot::InProgress) | None => false,
        }
    }

    /// Number of stored entries, including in-progress ones and expired
    /// entries the eviction task has not reached yet.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the cache.
    ///
    /// Every later `try_add` / `try_start` fails. Waits up to `timeout` for the
    /// eviction task to exit. Calling `stop` again is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.shared.lock().stopped = true;
        self.cancel.cancel();

        let task = self
            .eviction_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CacheError::EvictionTaskFailed(e.to_string())),
            Err(_) => Err(CacheError::StopTimeout(timeout)),
        }
    }
}

impl Drop for EventCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_eviction(shared: Arc<Shared>, cancel: CancellationToken, first_tick: Instant) {
    let period = shared.config.eviction_interval;
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = shared.lock().prune(Instant::now());
                if evicted > 0 {
                    trace!(evicted, "evicted expired cache entries");
                }
            }
        }
    }
    debug!("cache eviction task stopped");
}

// ─── In-Progress Token ────────────────────────────────────────────────────────

/// Exclusive claim on an identifier, returned by [`EventCache::try_start`].
#[derive(Debug)]
pub struct InProgress {
    shared: Arc<Shared>,
    id: String,
    finished: bool,
}

impl InProgress {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Releases the claim into a cooldown of one TTL from now.
    ///
    /// Idempotent: only the first call has any effect.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut state = self.shared.lock();
        let expiry = Instant::now() + self.shared.config.ttl;
        if state.entries.get(&self.id) == Some(&Slot::InProgress) {
            state.arm(&self.id, expiry);
        }
    }

    /// Releases the claim with no cooldown, so the next `try_start` wins.
    pub fn release(mut self) {
        self.finished = true;
        let mut state = self.shared.lock();
        if state.entries.get(&self.id) == Some(&Slot::InProgress) {
            state.entries.remove(&self.id);
        }
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.finish();
    }
}

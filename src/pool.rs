//! Connection pooling.
//!
//! [`PoolManager`] maps an [`Origin`] to its [`PerOriginPool`]; each pool
//! owns a bounded set of connections, split into an idle sequence and an
//! active set. HTTP/1.1 connections are checked out exclusively (LIFO, so
//! the warmest socket is reused first). Multiplexed connections stay in the
//! idle sequence while they have free stream capacity and move to the
//! active set only when saturated. Waiters queue FIFO when the pool is at
//! capacity in blocking mode.
//!
//! All pool state lives behind short std mutexes covering bookkeeping only;
//! no I/O happens under a pool lock.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Instant,
};

use log::{debug, trace};
use tokio::sync::oneshot;

use crate::{
    conn::{CloseReason, Conn},
    error::{Error, TimedOut},
    keepalive::{self, KeepalivePolicy},
    origin::Origin,
};

/// Limits applied to every per-origin pool and to the manager itself.
#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    /// Connections (idle + active + opening) per origin.
    pub(crate) max_per_origin: usize,
    /// Idle HTTP/1.1 connections kept per origin; the oldest beyond this
    /// are closed on release.
    pub(crate) max_idle_per_origin: usize,
    /// Per-origin pools kept by the manager; exceeding pools are evicted
    /// least-recently-used, but only when they have no active connections.
    pub(crate) num_pools: usize,
    /// Whether an at-capacity acquire queues (true) or fails fast (false).
    pub(crate) block_if_full: bool,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_per_origin: 10,
            max_idle_per_origin: 10,
            num_pools: 10,
            block_if_full: true,
        }
    }
}

/// How a borrow ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    /// The exchange completed and the connection may be reused.
    Ok,
    /// The connection is unusable and must be discarded.
    Broken,
}

/// Result of an acquire: either a live connection or the right to open one.
pub(crate) enum Acquired {
    Reused(Arc<Conn>),
    ToOpen(OpenPermit),
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquired::Reused(_) => f.write_str("Acquired::Reused(..)"),
            Acquired::ToOpen(_) => f.write_str("Acquired::ToOpen(..)"),
        }
    }
}

/// Permission to open one connection, counted against the pool bound while
/// the dial is in progress. Dropping it unfulfilled frees the slot and
/// wakes a waiter.
pub(crate) struct OpenPermit {
    pool: Arc<PerOriginPool>,
    fulfilled: bool,
}

impl OpenPermit {
    /// Registers a freshly opened connection as borrowed by the caller.
    pub(crate) fn fulfill(mut self, conn: &Arc<Conn>) {
        self.fulfilled = true;
        conn.attach_pool(&self.pool);
        conn.begin_stream(false);

        let mut state = self.pool.state.lock().expect("pool state poisoned");
        state.opening -= 1;
        if conn.is_multiplexed() && conn.available_streams() > 0 {
            // Unsaturated multiplexed connections are shareable
            // immediately.
            state.idle.push_front(conn.clone());
        } else {
            state.active.push(conn.clone());
        }
    }
}

impl Drop for OpenPermit {
    fn drop(&mut self) {
        if !self.fulfilled {
            let mut state = self.pool.state.lock().expect("pool state poisoned");
            state.opening -= 1;
            self.pool.wake_open(&mut state);
        }
    }
}

enum Handoff {
    /// A connection, already marked borrowed on the receiver's behalf.
    Conn(Arc<Conn>),
    /// A freed slot; `opening` was incremented on the receiver's behalf.
    Open,
}

struct PoolState {
    idle: VecDeque<Arc<Conn>>,
    active: Vec<Arc<Conn>>,
    opening: usize,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
    closed: bool,
}

pub(crate) struct PerOriginPool {
    origin: Origin,
    config: PoolConfig,
    keepalive: KeepalivePolicy,
    state: Mutex<PoolState>,
}

// ===== impl PerOriginPool =====

impl PerOriginPool {
    fn new(origin: Origin, config: PoolConfig, keepalive: KeepalivePolicy) -> Arc<PerOriginPool> {
        Arc::new(PerOriginPool {
            origin,
            config,
            keepalive,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: Vec::new(),
                opening: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        })
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Takes a connection, a permit to open one, or queues until `deadline`.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        deadline: Option<Instant>,
    ) -> Result<Acquired, Error> {
        let rx = {
            let mut state = self.state.lock().expect("pool state poisoned");
            if state.closed {
                return Err(Error::pool_closed());
            }
            self.prune(&mut state);

            if let Some(conn) = self.select(&mut state) {
                trace!("reusing conn {} for {:?}", conn.id(), self.origin);
                return Ok(Acquired::Reused(conn));
            }

            let total = state.idle.len() + state.active.len() + state.opening;
            if total < self.config.max_per_origin {
                state.opening += 1;
                return Ok(Acquired::ToOpen(OpenPermit {
                    pool: self.clone(),
                    fulfilled: false,
                }));
            }

            if !self.config.block_if_full {
                return Err(Error::pool_full());
            }

            trace!("pool for {:?} full, queueing waiter", self.origin);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let handoff = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), rx).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        // The dropped receiver makes our waiter slot dead;
                        // release() skips closed senders.
                        return Err(Error::timeout(TimedOut::Connect));
                    }
                }
            }
            None => rx.await,
        };

        match handoff {
            Ok(Handoff::Conn(conn)) => Ok(Acquired::Reused(conn)),
            Ok(Handoff::Open) => Ok(Acquired::ToOpen(OpenPermit {
                pool: self.clone(),
                fulfilled: false,
            })),
            Err(_) => Err(Error::pool_closed()),
        }
    }

    /// Picks the best reusable connection and marks it borrowed.
    fn select(&self, state: &mut PoolState) -> Option<Arc<Conn>> {
        // Multiplexed first: most free streams, freshest on ties.
        let mut best: Option<(usize, u32, Instant)> = None;
        for (i, conn) in state.idle.iter().enumerate() {
            if !conn.is_multiplexed() {
                continue;
            }
            let available = conn.available_streams();
            if available == 0 {
                continue;
            }
            let activity = conn.last_activity();
            let better = match best {
                None => true,
                Some((_, best_avail, best_activity)) => {
                    available > best_avail
                        || (available == best_avail && activity > best_activity)
                }
            };
            if better {
                best = Some((i, available, activity));
            }
        }
        if let Some((i, available, _)) = best {
            let conn = state.idle[i].clone();
            conn.begin_stream(true);
            if available == 1 {
                // That was the last free stream: saturated now.
                state.idle.remove(i);
                state.active.push(conn.clone());
            }
            return Some(conn);
        }

        // HTTP/1.1: LIFO, so the warmest socket goes out first.
        while let Some(conn) = state.idle.pop_front() {
            if conn.is_multiplexed() {
                // Saturated or dying multiplexed connection; put it where
                // it belongs and keep scanning.
                if conn.in_flight() > 0 {
                    state.active.push(conn);
                }
                continue;
            }
            if !conn.is_open() || conn.past_retirement() {
                conn.drain();
                continue;
            }
            conn.begin_stream(true);
            state.active.push(conn.clone());
            return Some(conn);
        }
        None
    }

    /// Drops dead connections from the idle sequence, keeping draining ones
    /// with in-flight streams accounted for in the active set.
    fn prune(&self, state: &mut PoolState) {
        let mut keep = VecDeque::with_capacity(state.idle.len());
        while let Some(conn) = state.idle.pop_front() {
            if conn.past_retirement() && !conn.is_closed() {
                debug!("conn {} past retirement (age {:?}), draining", conn.id(), conn.age());
                conn.drain();
            }
            if conn.is_open() {
                keep.push_back(conn);
            } else if conn.in_flight() > 0 {
                state.active.push(conn);
            }
            // else: dropped; transport closes with the last reference.
        }
        state.idle = keep;
        state.active.retain(|conn| conn.in_flight() > 0 || conn.is_open());
    }

    /// Returns a borrow. `Ok` outcomes park or hand off the connection;
    /// `Broken` discards it and frees the slot.
    pub(crate) fn release(&self, conn: &Arc<Conn>, outcome: ReleaseOutcome) {
        let remaining = conn.end_stream();
        let mut state = self.state.lock().expect("pool state poisoned");

        if state.closed {
            conn.close(CloseReason::Shutdown);
            remove_conn(&mut state, conn);
            return;
        }

        if outcome == ReleaseOutcome::Broken {
            debug!("discarding broken conn {}", conn.id());
            conn.close(CloseReason::Error);
            remove_conn(&mut state, conn);
            self.wake_open(&mut state);
            return;
        }

        if !conn.is_multiplexed() {
            self.release_h1(&mut state, conn);
        } else {
            self.release_stream(&mut state, conn, remaining);
        }
    }

    fn release_h1(&self, state: &mut PoolState, conn: &Arc<Conn>) {
        state.active.retain(|c| !Arc::ptr_eq(c, conn));

        if !conn.is_open() || conn.past_retirement() {
            conn.close(CloseReason::Retired);
            self.wake_open(state);
            return;
        }

        // Hand off directly to the longest waiter, if any.
        while let Some(tx) = state.waiters.pop_front() {
            if tx.is_closed() {
                continue;
            }
            conn.begin_stream(true);
            match tx.send(Handoff::Conn(conn.clone())) {
                Ok(()) => {
                    state.active.push(conn.clone());
                    return;
                }
                Err(_) => {
                    // Receiver vanished between the check and the send.
                    conn.end_stream();
                }
            }
        }

        trace!("parking idle conn {} for {:?}", conn.id(), self.origin);
        state.idle.push_front(conn.clone());
        while state.idle.len() > self.config.max_idle_per_origin {
            if let Some(oldest) = state.idle.pop_back() {
                debug!("evicting idle conn {} over max_idle", oldest.id());
                oldest.close(CloseReason::Retired);
            }
        }
    }

    fn release_stream(&self, state: &mut PoolState, conn: &Arc<Conn>, remaining: u32) {
        if conn.is_draining() {
            if remaining == 0 {
                conn.close(CloseReason::Shutdown);
                remove_conn(state, conn);
                self.wake_open(state);
            }
            return;
        }
        if !conn.is_open() {
            remove_conn(state, conn);
            self.wake_open(state);
            return;
        }

        // Freed capacity: back from the saturated set into the shareable
        // sequence.
        if let Some(pos) = state.active.iter().position(|c| Arc::ptr_eq(c, conn)) {
            state.active.remove(pos);
            state.idle.push_front(conn.clone());
        }

        // Capacity freed on a shared connection can serve waiters directly.
        while conn.available_streams() > 0 {
            let Some(tx) = state.waiters.pop_front() else { break };
            if tx.is_closed() {
                continue;
            }
            conn.begin_stream(true);
            if tx.send(Handoff::Conn(conn.clone())).is_err() {
                conn.end_stream();
            }
        }
        if conn.available_streams() == 0 && conn.in_flight() > 0 {
            if let Some(pos) = state.idle.iter().position(|c| Arc::ptr_eq(c, conn)) {
                state.idle.remove(pos);
                state.active.push(conn.clone());
            }
        }

        if conn.in_flight() == 0 {
            keepalive::arm(&self.keepalive, conn);
        }
    }

    /// Hands a connection over to a protocol extension: the pool forgets
    /// it (freeing the slot), while the extension keeps the transport it
    /// already took out.
    pub(crate) fn dedicate(&self, conn: &Arc<Conn>) {
        conn.end_stream();
        conn.close(CloseReason::Upgraded);
        let mut state = self.state.lock().expect("pool state poisoned");
        remove_conn(&mut state, conn);
        if !state.closed {
            self.wake_open(&mut state);
        }
    }

    /// Removes a connection the keepalive scheduler (or a transport error
    /// path) found dead.
    pub(crate) fn discard(&self, conn: &Arc<Conn>) {
        let mut state = self.state.lock().expect("pool state poisoned");
        remove_conn(&mut state, conn);
        if !state.closed {
            self.wake_open(&mut state);
        }
    }

    /// Wakes the longest waiter with permission to open a fresh connection.
    fn wake_open(&self, state: &mut PoolState) {
        let total = state.idle.len() + state.active.len() + state.opening;
        if total >= self.config.max_per_origin {
            return;
        }
        while let Some(tx) = state.waiters.pop_front() {
            if tx.is_closed() {
                continue;
            }
            state.opening += 1;
            if tx.send(Handoff::Open).is_ok() {
                return;
            }
            state.opening -= 1;
        }
    }

    /// Drains every connection and fails all waiters.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.closed = true;
        // Dropping the senders fails every queued waiter.
        state.waiters.clear();
        for conn in state.idle.drain(..) {
            conn.drain();
        }
        for conn in state.active.drain(..) {
            conn.drain();
        }
        state.opening = 0;
    }

    /// Whether the manager may evict this pool (nothing borrowed, opening,
    /// or queued).
    fn is_evictable(&self) -> bool {
        let state = self.state.lock().expect("pool state poisoned");
        state.active.is_empty()
            && state.opening == 0
            && state.waiters.is_empty()
            && state.idle.iter().all(|c| c.in_flight() == 0)
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    #[cfg(test)]
    pub(crate) fn active_len(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    #[cfg(test)]
    pub(crate) fn total_len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.idle.len() + state.active.len() + state.opening
    }
}

fn remove_conn(state: &mut PoolState, conn: &Arc<Conn>) {
    state.idle.retain(|c| !Arc::ptr_eq(c, conn));
    state.active.retain(|c| !Arc::ptr_eq(c, conn));
}

impl std::fmt::Debug for PerOriginPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("pool state poisoned");
        f.debug_struct("PerOriginPool")
            .field("origin", &self.origin)
            .field("idle", &state.idle.len())
            .field("active", &state.active.len())
            .field("opening", &state.opening)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

// ===== impl PoolManager =====

struct ManagerInner {
    pools: HashMap<Origin, Arc<PerOriginPool>>,
    /// Origins in least-recently-used order, front = coldest.
    order: VecDeque<Origin>,
    closed: bool,
}

pub(crate) struct PoolManager {
    config: PoolConfig,
    keepalive: KeepalivePolicy,
    inner: Mutex<ManagerInner>,
}

impl PoolManager {
    pub(crate) fn new(config: PoolConfig, keepalive: KeepalivePolicy) -> PoolManager {
        PoolManager {
            config,
            keepalive,
            inner: Mutex::new(ManagerInner {
                pools: HashMap::new(),
                order: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// The pool for `origin`, created on first use. A short critical
    /// section covers the map; eviction of cold empty pools keeps the
    /// manager within `num_pools`.
    pub(crate) fn pool_for(&self, origin: &Origin) -> Result<Arc<PerOriginPool>, Error> {
        let mut inner = self.inner.lock().expect("pool manager poisoned");
        if inner.closed {
            return Err(Error::pool_closed());
        }

        if let Some(pool) = inner.pools.get(origin).cloned() {
            touch_lru(&mut inner.order, origin);
            return Ok(pool);
        }

        let pool = PerOriginPool::new(
            origin.clone(),
            self.config.clone(),
            self.keepalive.clone(),
        );
        inner.pools.insert(origin.clone(), pool.clone());
        inner.order.push_back(origin.clone());

        if inner.pools.len() > self.config.num_pools {
            self.evict_cold(&mut inner);
        }

        Ok(pool)
    }

    /// Evicts least-recently-used pools with no activity until the cap is
    /// met (or nothing more is evictable).
    fn evict_cold(&self, inner: &mut ManagerInner) {
        let mut i = 0;
        while inner.pools.len() > self.config.num_pools && i < inner.order.len() {
            let origin = inner.order[i].clone();
            let evictable = inner
                .pools
                .get(&origin)
                .is_some_and(|pool| pool.is_evictable());
            if evictable {
                debug!("evicting cold pool for {:?}", origin);
                if let Some(pool) = inner.pools.remove(&origin) {
                    pool.shutdown();
                }
                inner.order.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Closes every pool. In-flight streams finish; everything else closes
    /// now.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("pool manager poisoned");
        inner.closed = true;
        for (_, pool) in inner.pools.drain() {
            pool.shutdown();
        }
        inner.order.clear();
    }

    #[cfg(test)]
    pub(crate) fn pool_count(&self) -> usize {
        self.inner.lock().unwrap().pools.len()
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("pool manager poisoned");
        f.debug_struct("PoolManager")
            .field("pools", &inner.pools.len())
            .finish()
    }
}

fn touch_lru(order: &mut VecDeque<Origin>, origin: &Origin) {
    if let Some(pos) = order.iter().position(|o| o == origin) {
        let origin = order.remove(pos).expect("position just found");
        order.push_back(origin);
    }
}

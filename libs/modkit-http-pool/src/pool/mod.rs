//! Bounded connection pool keyed by destination.
//!
//! ## Accounting
//!
//! Every connection counts against its destination and against the pool
//! total from the moment a slot is reserved for it until it is destroyed:
//! idle, leased, and still connecting all count. Acquisition never lets
//! either count exceed its cap; when both are saturated the caller waits on
//! a [`Notify`] until a slot frees or the acquire timeout elapses.
//!
//! ## Ownership
//!
//! [`ConnectionPool`] is a holder handle. Cloning registers another holder;
//! dropping or [`shutdown`](ConnectionPool::shutdown) releases it. A pool is
//! torn down when its last holder goes away, or immediately on `shutdown`
//! unless it is configured as shared.

mod connector;
mod destination;
mod evictor;

pub use connector::{Connect, HttpConnection, HyperConnector, Poolable, SocketOptions};
pub use destination::{Destination, Scheme};
pub use evictor::{EvictorState, IdleEvictor, SweepTarget};

use crate::config::{EffectivePoolConfig, PoolConfig, TlsTrust};
use crate::error::HttpError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections alive or being established
    pub total: usize,
    /// Free connections waiting for reuse
    pub idle: usize,
    /// Connections handed out to callers or being established
    pub leased: usize,
    /// Connections per destination (idle and leased)
    pub per_destination: HashMap<Destination, usize>,
}

/// A live connection plus the bookkeeping the pool needs about it.
struct Entry<T> {
    id: u64,
    created: Instant,
    conn: T,
}

struct IdleEntry<T> {
    entry: Entry<T>,
    idle_since: Instant,
    /// End of the keep-alive window granted by the server (or the default)
    reusable_until: Instant,
}

struct PoolState<T> {
    idle: HashMap<Destination, VecDeque<IdleEntry<T>>>,
    per_destination: HashMap<Destination, usize>,
    total: usize,
    idle_count: usize,
    next_id: u64,
    closed: bool,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            per_destination: HashMap::new(),
            total: 0,
            idle_count: 0,
            next_id: 0,
            closed: false,
        }
    }

    fn reserve(&mut self, destination: &Destination) {
        *self
            .per_destination
            .entry(destination.clone())
            .or_insert(0) += 1;
        self.total += 1;
    }

    fn forget(&mut self, destination: &Destination) {
        if let Some(count) = self.per_destination.get_mut(destination) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_destination.remove(destination);
            }
        }
        self.total = self.total.saturating_sub(1);
    }

    fn count_for(&self, destination: &Destination) -> usize {
        self.per_destination.get(destination).copied().unwrap_or(0)
    }

    /// Remove every idle entry matching `stale`, returning them for disposal.
    fn drain_idle(&mut self, mut stale: impl FnMut(&IdleEntry<T>) -> bool) -> Vec<Entry<T>> {
        let mut removed = Vec::new();
        let mut emptied = Vec::new();

        for (destination, queue) in &mut self.idle {
            let mut kept = VecDeque::with_capacity(queue.len());
            for idle in queue.drain(..) {
                if stale(&idle) {
                    removed.push((destination.clone(), idle.entry));
                } else {
                    kept.push_back(idle);
                }
            }
            *queue = kept;
            if queue.is_empty() {
                emptied.push(destination.clone());
            }
        }

        for destination in emptied {
            self.idle.remove(&destination);
        }

        self.idle_count -= removed.len();
        removed
            .into_iter()
            .map(|(destination, entry)| {
                self.forget(&destination);
                entry
            })
            .collect()
    }

    /// Close the least recently used idle connection of another destination.
    fn evict_lru_except(&mut self, destination: &Destination) -> Option<Entry<T>> {
        let victim = self
            .idle
            .iter()
            .filter(|(d, _)| *d != destination)
            .filter_map(|(d, queue)| queue.front().map(|idle| (d, idle.idle_since)))
            .min_by_key(|(_, since)| *since)
            .map(|(d, _)| d.clone())?;

        let queue = self.idle.get_mut(&victim)?;
        let idle = queue.pop_front()?;
        if queue.is_empty() {
            self.idle.remove(&victim);
        }
        self.idle_count -= 1;
        self.forget(&victim);
        Some(idle.entry)
    }
}

enum Checkout<T> {
    Reused(Entry<T>),
    Reserved,
    Saturated,
}

struct PoolInner<C: Connect> {
    connector: C,
    config: EffectivePoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    available: Notify,
    holders: AtomicUsize,
    evictor: IdleEvictor,
}

impl<C: Connect> PoolInner<C> {
    fn is_expired(&self, entry: &Entry<C::Connection>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created) > self.config.max_lifetime
    }

    fn is_stale(&self, idle: &IdleEntry<C::Connection>, now: Instant) -> bool {
        self.is_expired(&idle.entry, now)
            || now >= idle.reusable_until
            || now.saturating_duration_since(idle.idle_since) > self.config.max_idle
            || !idle.entry.conn.is_open()
    }

    fn try_checkout(
        &self,
        destination: &Destination,
        stale: &mut Vec<Entry<C::Connection>>,
    ) -> Result<Checkout<C::Connection>, HttpError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.closed {
            return Err(HttpError::PoolClosed);
        }

        while let Some(idle) = state.idle.get_mut(destination).and_then(VecDeque::pop_back) {
            state.idle_count -= 1;
            if self.is_stale(&idle, now) {
                state.forget(destination);
                stale.push(idle.entry);
            } else {
                if state.idle.get(destination).is_some_and(VecDeque::is_empty) {
                    state.idle.remove(destination);
                }
                return Ok(Checkout::Reused(idle.entry));
            }
        }
        state.idle.remove(destination);

        if state.count_for(destination) >= self.config.max_per_destination {
            return Ok(Checkout::Saturated);
        }

        if state.total >= self.config.max_total {
            match state.evict_lru_except(destination) {
                Some(victim) => stale.push(victim),
                None => return Ok(Checkout::Saturated),
            }
        }

        state.reserve(destination);
        Ok(Checkout::Reserved)
    }

    fn next_entry(&self, conn: C::Connection) -> Entry<C::Connection> {
        let mut state = self.state.lock();
        state.next_id += 1;
        Entry {
            id: state.next_id,
            created: Instant::now(),
            conn,
        }
    }

    fn release(&self, destination: &Destination, entry: Entry<C::Connection>, keep_alive: Duration) {
        let now = Instant::now();
        let discarded = {
            let mut state = self.state.lock();
            if state.closed || self.is_expired(&entry, now) || !entry.conn.is_open() {
                state.forget(destination);
                Some(entry)
            } else {
                tracing::trace!(destination = %destination, id = entry.id, "connection returned to pool");
                state
                    .idle
                    .entry(destination.clone())
                    .or_default()
                    .push_back(IdleEntry {
                        entry,
                        idle_since: now,
                        reusable_until: now + keep_alive,
                    });
                state.idle_count += 1;
                None
            }
        };

        if let Some(entry) = discarded {
            tracing::trace!(destination = %destination, id = entry.id, "connection retired on release");
            drop(entry);
        }
        self.available.notify_waiters();
    }

    fn discard(&self, destination: &Destination, entry: Option<Entry<C::Connection>>) {
        self.state.lock().forget(destination);
        if let Some(entry) = entry {
            tracing::trace!(destination = %destination, id = entry.id, "connection destroyed");
            drop(entry);
        }
        self.available.notify_waiters();
    }

    fn sweep(
        &self,
        stale: impl FnMut(&IdleEntry<C::Connection>) -> bool,
    ) -> Result<usize, HttpError> {
        let removed = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(HttpError::PoolClosed);
            }
            state.drain_idle(stale)
        };

        let count = removed.len();
        drop(removed);
        if count > 0 {
            self.available.notify_waiters();
        }
        Ok(count)
    }

    fn teardown(&self) {
        let removed = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.drain_idle(|_| true)
        };

        self.evictor.stop();
        tracing::debug!(closed = removed.len(), "connection pool shut down");
        drop(removed);
        self.available.notify_waiters();
    }
}

impl<C: Connect> SweepTarget for PoolInner<C> {
    fn close_expired(&self) -> Result<usize, HttpError> {
        let now = Instant::now();
        self.sweep(|idle| {
            self.is_expired(&idle.entry, now)
                || now >= idle.reusable_until
                || !idle.entry.conn.is_open()
        })
    }

    fn close_idle(&self, max_idle: Duration) -> Result<usize, HttpError> {
        let now = Instant::now();
        self.sweep(|idle| now.saturating_duration_since(idle.idle_since) > max_idle)
    }
}

/// Bounded pool of reusable connections keyed by [`Destination`].
pub struct ConnectionPool<C: Connect> {
    inner: Arc<PoolInner<C>>,
    released: AtomicBool,
}

impl<C: Connect> ConnectionPool<C> {
    /// Create a pool; its [`IdleEvictor`] is created but not started.
    #[must_use]
    pub fn new(connector: C, config: EffectivePoolConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner<C>>| {
            let target: Weak<dyn SweepTarget> = weak.clone();
            PoolInner {
                connector,
                config,
                state: Mutex::new(PoolState::new()),
                available: Notify::new(),
                holders: AtomicUsize::new(1),
                evictor: IdleEvictor::new(target, config.eviction_interval, config.max_idle),
            }
        });

        Self {
            inner,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EffectivePoolConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Start the pool's idle evictor. Further calls are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Configuration`] outside a Tokio runtime.
    pub fn start_eviction(&self) -> Result<(), HttpError> {
        self.inner.evictor.start()
    }

    #[must_use]
    pub fn evictor_state(&self) -> EvictorState {
        self.inner.evictor.state()
    }

    /// Acquire a connection to `destination`.
    ///
    /// Reuses the most recently released usable connection, otherwise opens
    /// a new one if both caps allow, otherwise waits for capacity until the
    /// acquire timeout elapses.
    ///
    /// # Errors
    ///
    /// - [`HttpError::PoolExhausted`] when no capacity freed in time
    /// - [`HttpError::PoolClosed`] after shutdown
    /// - connector errors when opening a new connection fails
    pub async fn acquire(&self, destination: &Destination) -> Result<Pooled<C>, HttpError> {
        if self.released.load(Ordering::Acquire) {
            return Err(HttpError::PoolClosed);
        }

        let started = Instant::now();
        let deadline = started + self.inner.config.acquire_timeout;

        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut stale = Vec::new();
            let checkout = self.inner.try_checkout(destination, &mut stale);
            drop(stale);

            match checkout? {
                Checkout::Reused(entry) => {
                    tracing::trace!(destination = %destination, id = entry.id, "reusing pooled connection");
                    return Ok(Pooled::new(Arc::clone(&self.inner), destination.clone(), entry));
                }
                Checkout::Reserved => {
                    let reservation = Reservation {
                        pool: &self.inner,
                        destination,
                        armed: true,
                    };
                    let conn = self.inner.connector.connect(destination).await?;
                    reservation.commit();

                    let entry = self.inner.next_entry(conn);
                    tracing::debug!(destination = %destination, id = entry.id, "opened new pooled connection");
                    return Ok(Pooled::new(Arc::clone(&self.inner), destination.clone(), entry));
                }
                Checkout::Saturated => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited = Instant::now().saturating_duration_since(started);
                        tracing::debug!(destination = %destination, waited_ms = waited.as_millis(), "connection pool exhausted");
                        return Err(HttpError::PoolExhausted {
                            destination: destination.to_string(),
                            waited,
                        });
                    }
                }
            }
        }
    }

    /// Destroy free connections past their lifetime or keep-alive window.
    ///
    /// Leased connections past their lifetime are destroyed when released.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::PoolClosed`] after shutdown.
    pub fn close_expired(&self) -> Result<usize, HttpError> {
        self.inner.close_expired()
    }

    /// Destroy free connections idle for longer than `max_idle`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::PoolClosed`] after shutdown.
    pub fn close_idle(&self, max_idle: Duration) -> Result<usize, HttpError> {
        self.inner.close_idle(max_idle)
    }

    /// Release this holder and tear the pool down if appropriate.
    ///
    /// A non-shared pool is torn down immediately. A shared pool is torn
    /// down only when this is its last holder. Further calls on the same
    /// handle are no-ops; acquiring through a released handle fails with
    /// [`HttpError::PoolClosed`].
    pub fn shutdown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let last = self.inner.holders.fetch_sub(1, Ordering::AcqRel) == 1;
        if last || !self.inner.config.shared {
            self.inner.teardown();
        } else {
            tracing::debug!("released shared connection pool holder; pool stays open");
        }
    }

    /// Whether this handle was released or the pool torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.inner.state.lock().closed
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle_count,
            leased: state.total.saturating_sub(state.idle_count),
            per_destination: state.per_destination.clone(),
        }
    }
}

impl ConnectionPool<HyperConnector> {
    /// Pool of HTTP/1.1 connections opened by a [`HyperConnector`].
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn from_config(config: &PoolConfig, trust: TlsTrust) -> Result<Self, HttpError> {
        let config = config.effective();
        Ok(Self::new(HyperConnector::for_config(&config, trust)?, config))
    }
}

impl<C: Connect> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        self.inner.holders.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        }
    }
}

impl<C: Connect> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.inner.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.teardown();
        }
    }
}

/// Undoes a slot reservation unless the connect succeeded.
struct Reservation<'a, C: Connect> {
    pool: &'a PoolInner<C>,
    destination: &'a Destination,
    armed: bool,
}

impl<C: Connect> Reservation<'_, C> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<C: Connect> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.discard(self.destination, None);
        }
    }
}

/// A connection leased from a [`ConnectionPool`].
///
/// Call [`release`](Self::release) once the exchange completed cleanly to
/// return it for reuse. Dropping it without releasing destroys the
/// connection and frees its slot, so a cancelled or failed exchange never
/// leaves a half-used connection in the pool.
pub struct Pooled<C: Connect> {
    pool: Arc<PoolInner<C>>,
    destination: Destination,
    entry: Option<Entry<C::Connection>>,
    keep_alive: Duration,
}

impl<C: Connect> Pooled<C> {
    fn new(pool: Arc<PoolInner<C>>, destination: Destination, entry: Entry<C::Connection>) -> Self {
        let keep_alive = pool.config.keep_alive;
        Self {
            pool,
            destination,
            entry: Some(entry),
            keep_alive,
        }
    }

    /// Pool-unique connection id (stable across reuse)
    #[must_use]
    pub fn id(&self) -> u64 {
        self.entry.as_ref().map_or(0, |e| e.id)
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Override the reuse window applied when the connection is released
    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        self.keep_alive = keep_alive;
    }

    /// Return the connection to the pool for reuse.
    pub fn release(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(&self.destination, entry, self.keep_alive);
        }
    }

    /// Destroy the connection and free its slot.
    pub fn discard(mut self) {
        let entry = self.entry.take();
        self.pool.discard(&self.destination, entry);
    }
}

impl<C: Connect> Deref for Pooled<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.entry {
            Some(entry) => &entry.conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<C: Connect> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.entry {
            Some(entry) => &mut entry.conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<C: Connect> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.discard(&self.destination, Some(entry));
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests;

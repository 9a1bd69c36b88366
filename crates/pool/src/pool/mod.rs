//! Keyed connection pool.
//!
//! One mutex guards the bookkeeping for every key ([`state::PoolState`]);
//! it is never held across an `.await`. Connector calls (connect, probe,
//! reset, terminate) run outside the lock on slots that are temporarily
//! owned by a single task and accounted for as `pending`, so the capacity
//! invariant `idle + active + pending <= max` holds at every lock release.

mod config;
mod state;

pub use config::PoolConfig;
pub use state::PoolStats;

use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionConfig;
use crate::error::{ConnectError, Error, Result};
use crate::events::{DestroyReason, EventBus, PoolEvent};
use crate::evictor::{self, EvictionPolicy, IdleEvictionPolicy, SweepReport};
use crate::lifecycle::{Connector, Lifecycle};
use crate::pooled::Pooled;
use crate::registry::{RegisterOutcome, Registration, Registry};
use crate::slot::Slot;

pub(crate) use state::{Checkout, KeyState, PoolState};

/// Inner shared state for the pool.
pub(crate) struct PoolInner<C: Connector> {
    pub(crate) lifecycle: Lifecycle<C>,
    pub(crate) registry: Registry,
    pub(crate) config: PoolConfig,
    pub(crate) policy: Box<dyn EvictionPolicy>,
    pub(crate) state: Mutex<PoolState<C::Connection>>,
    pub(crate) events: EventBus,
    cancel: CancellationToken,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Capacity accounting guards
// ---------------------------------------------------------------------------

/// Capacity held by a slot that is neither idle nor checked out.
///
/// Whoever bumps `pending` under the lock creates the matching reservation
/// before releasing it. Dropping an unsettled reservation, which is what a
/// cancelled borrow does, gives the capacity back and wakes a waiter.
pub(crate) struct Reservation<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    key: Arc<str>,
    armed: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
    pub(crate) fn counted(inner: &'a PoolInner<C>, key: Arc<str>) -> Self {
        Self {
            inner,
            key,
            armed: true,
        }
    }

    /// A reservation for a slot that no longer counts against capacity.
    pub(crate) fn detached(inner: &'a PoolInner<C>, key: Arc<str>) -> Self {
        Self {
            inner,
            key,
            armed: false,
        }
    }

    pub(crate) fn key(&self) -> &Arc<str> {
        &self.key
    }

    /// Give the capacity back as part of a transition made under the lock.
    pub(crate) fn settle(mut self, state: &mut PoolState<C::Connection>) {
        if self.armed {
            let ks = state.key_mut(&self.key);
            ks.pending = ks.pending.saturating_sub(1);
            self.armed = false;
        }
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            let ks = state.key_mut(&self.key);
            ks.pending = ks.pending.saturating_sub(1);
            self.inner.wake(&state, &self.key);
        }
    }
}

/// Registration of one blocked borrower in its key's waiter count.
struct WaiterGuard<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    key: Arc<str>,
    woken: bool,
}

impl<C: Connector> Drop for WaiterGuard<'_, C> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let ks = state.key_mut(&self.key);
        ks.waiters = ks.waiters.saturating_sub(1);
        if self.woken {
            return;
        }
        // Gave up without being woken; capacity that showed up meanwhile
        // belongs to the next waiter.
        let has_waiters = ks.waiters > 0;
        let has_idle = !ks.idle.is_empty();
        if has_waiters && (has_idle || state.can_create(&self.key, &self.inner.config)) {
            state.key_mut(&self.key).notify.notify_one();
        }
    }
}

enum Step<'a, C: Connector> {
    Idle(Slot<C::Connection>, Reservation<'a, C>),
    Create(Reservation<'a, C>),
    Reclaim(Slot<C::Connection>, Reservation<'a, C>),
    Wait(WaiterGuard<'a, C>),
    Retry,
    Full {
        active: usize,
        idle: usize,
        waiters: usize,
    },
}

enum Attempt<'a, C: Connector> {
    Ready(Pooled<C>),
    Wait(WaiterGuard<'a, C>),
    Full(Error),
}

// ---------------------------------------------------------------------------
// PoolInner
// ---------------------------------------------------------------------------

impl<C: Connector> PoolInner<C> {
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wake borrowers after idle capacity or headroom for `key` appeared.
    ///
    /// Falls back to a waiter of another key when a global cap is set,
    /// since freed capacity is shared.
    pub(crate) fn wake(&self, state: &PoolState<C::Connection>, key: &str) {
        if let Some(ks) = state.key(key)
            && ks.waiters > 0
        {
            self.notify(ks);
            return;
        }
        if self.config.max_total.is_some()
            && let Some(ks) = state.keys.values().find(|ks| ks.waiters > 0)
        {
            self.notify(ks);
        }
    }

    fn notify(&self, ks: &KeyState<C::Connection>) {
        if self.config.fairness {
            ks.notify.notify_one();
        } else {
            ks.notify.notify_waiters();
        }
    }

    pub(crate) fn record_created(&self, slot: &Slot<C::Connection>) {
        self.state.lock().key_mut(slot.key_arc()).counters.created += 1;
        debug!(key = slot.key(), slot = %slot.id(), "connection created");
        self.events.emit(PoolEvent::Created {
            key: slot.key().to_owned(),
            slot: slot.id(),
        });
    }

    pub(crate) fn record_validation_failure(&self, key: &Arc<str>) {
        self.state.lock().key_mut(key).counters.validation_failures += 1;
    }

    /// Terminate a slot's connection and release its capacity.
    pub(crate) async fn destroy(
        &self,
        mut slot: Slot<C::Connection>,
        reservation: Reservation<'_, C>,
        reason: DestroyReason,
    ) {
        slot.mark_invalid();
        let id = slot.id();
        let key = Arc::clone(slot.key_arc());
        self.lifecycle.terminate(&key, slot.into_conn()).await;
        {
            let mut state = self.state.lock();
            reservation.settle(&mut state);
            state.key_mut(&key).counters.destroyed += 1;
            self.wake(&state, &key);
        }
        debug!(key = %key, slot = %id, %reason, "connection destroyed");
        self.events.emit(PoolEvent::Destroyed {
            key: key.to_string(),
            slot: id,
            reason,
        });
    }

    /// Remove a slot from the checkout table, reserving its capacity.
    fn check_in(&self, slot: &Slot<C::Connection>) -> (Reservation<'_, C>, Option<Checkout>) {
        let key = Arc::clone(slot.key_arc());
        let mut state = self.state.lock();
        let ks = state.key_mut(&key);
        let checkout = ks.checked_out.remove(&slot.id());
        if checkout.is_some_and(|c| !c.abandoned) {
            ks.pending += 1;
            (Reservation::counted(self, key), checkout)
        } else {
            (Reservation::detached(self, key), checkout)
        }
    }

    /// Return a borrowed slot: recycle it into the idle queue or destroy it.
    pub(crate) async fn release(&self, mut slot: Slot<C::Connection>) {
        let key = Arc::clone(slot.key_arc());
        self.state.lock().key_mut(&key).counters.returned += 1;

        let (reservation, checkout) = self.check_in(&slot);
        let held = match checkout {
            Some(checkout) if !checkout.abandoned => checkout.borrowed_at.elapsed(),
            Some(_) => {
                slot.mark_abandoned();
                warn!(key = %key, slot = %slot.id(), "abandoned connection came back");
                self.destroy(slot, reservation, DestroyReason::Abandoned).await;
                return;
            }
            None => {
                debug!(key = %key, slot = %slot.id(), "returned slot is not checked out");
                self.destroy(slot, reservation, DestroyReason::Invalidated).await;
                return;
            }
        };

        if let Some(reason) = self.recycle_verdict(&mut slot).await {
            self.destroy(slot, reservation, reason).await;
            return;
        }

        let id = slot.id();
        let parked = {
            let mut state = self.state.lock();
            let closed = state.closed;
            let ks = state.key_mut(&key);
            if closed {
                Err((slot, reservation, DestroyReason::Shutdown))
            } else if ks.idle.len() >= self.config.max_idle_per_key {
                Err((slot, reservation, DestroyReason::MaxIdleExceeded))
            } else {
                slot.mark_idle(Instant::now());
                ks.idle.push_back(slot);
                reservation.settle(&mut state);
                self.wake(&state, &key);
                Ok(())
            }
        };

        match parked {
            Ok(()) => {
                debug!(key = %key, slot = %id, ?held, "connection returned to pool");
                self.events.emit(PoolEvent::Returned {
                    key: key.to_string(),
                    slot: id,
                    held,
                });
            }
            Err((slot, reservation, reason)) => self.destroy(slot, reservation, reason).await,
        }
    }

    /// Decide whether a returned slot must be destroyed instead of recycled.
    async fn recycle_verdict(&self, slot: &mut Slot<C::Connection>) -> Option<DestroyReason> {
        if self.is_closed() {
            return Some(DestroyReason::Shutdown);
        }
        let Some(registration) = self
            .registry
            .get(slot.key())
            .filter(|registration| registration.generation() == slot.generation())
        else {
            return Some(DestroyReason::StaleConfig);
        };
        if registration.auto_discard() {
            return Some(DestroyReason::AutoDiscard);
        }
        if let Some(base_path) = registration.base_path()
            && let Err(err) = self.lifecycle.reset(slot.conn_mut(), base_path).await
        {
            warn!(key = slot.key(), base_path, error = %err, "failed to reset working directory");
            return Some(DestroyReason::PassivationFailed);
        }
        if self.config.validate_on_return && !self.lifecycle.is_alive(slot.conn()).await {
            self.record_validation_failure(slot.key_arc());
            return Some(DestroyReason::ValidationFailed);
        }
        None
    }

    /// Invalidate a borrowed slot.
    pub(crate) async fn discard(&self, slot: Slot<C::Connection>, reason: DestroyReason) {
        let (reservation, _) = self.check_in(&slot);
        self.destroy(slot, reservation, reason).await;
    }

    /// Account for a slot dropped where no runtime can run its teardown.
    pub(crate) fn forget(&self, slot: Slot<C::Connection>) {
        let key = Arc::clone(slot.key_arc());
        {
            let mut state = self.state.lock();
            let ks = state.key_mut(&key);
            ks.checked_out.remove(&slot.id());
            ks.counters.destroyed += 1;
            self.wake(&state, &key);
        }
        warn!(key = %key, slot = %slot.id(), "connection dropped outside a runtime; closed without teardown");
    }

    /// Take idle slots out of their queues, reserving their capacity.
    fn drain_idle(&self, key: Option<&str>) -> Vec<(Slot<C::Connection>, Reservation<'_, C>)> {
        let mut state = self.state.lock();
        let mut drained = Vec::new();
        for (k, ks) in state
            .keys
            .iter_mut()
            .filter(|(k, _)| key.is_none_or(|key| k.as_ref() == key))
        {
            ks.pending += ks.idle.len();
            drained.extend(
                ks.idle
                    .drain(..)
                    .map(|slot| (slot, Reservation::counted(self, Arc::clone(k)))),
            );
        }
        drained
    }

    /// Create idle slots for `key` until it reaches `min_idle_per_key`.
    ///
    /// Stops early when borrowers are waiting, since they take priority
    /// for any capacity left.
    pub(crate) async fn fill_idle(
        &self,
        key: &Arc<str>,
        registration: &Registration,
    ) -> std::result::Result<usize, ConnectError> {
        let mut added = 0;
        loop {
            let reservation = {
                let mut state = self.state.lock();
                if state.closed {
                    break;
                }
                let ks = state.key_mut(key);
                if ks.waiters > 0 || ks.idle.len() + ks.pending >= self.config.min_idle_per_key {
                    break;
                }
                if !state.can_create(key, &self.config) {
                    break;
                }
                state.key_mut(key).pending += 1;
                Reservation::counted(self, Arc::clone(key))
            };

            let conn = self
                .lifecycle
                .create(registration)
                .await
                .inspect_err(|_| self.state.lock().key_mut(key).counters.create_failures += 1)?;
            let mut slot = Slot::new(Arc::clone(key), registration.generation(), conn);
            self.record_created(&slot);
            let parked = {
                let mut state = self.state.lock();
                if state.closed {
                    Err((slot, reservation))
                } else {
                    slot.mark_idle(Instant::now());
                    state.key_mut(key).idle.push_back(slot);
                    reservation.settle(&mut state);
                    self.wake(&state, key);
                    Ok(())
                }
            };
            if let Err((slot, reservation)) = parked {
                // Closed while connecting.
                self.destroy(slot, reservation, DestroyReason::Shutdown).await;
                break;
            }
            added += 1;
        }
        Ok(added)
    }
}

// ---------------------------------------------------------------------------
// KeyedPool<C>
// ---------------------------------------------------------------------------

/// Keyed pool of SFTP sessions.
///
/// Holds independent idle queues per endpoint key under shared per-key and
/// global caps. Cloning is cheap and every clone refers to the same pool.
pub struct KeyedPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for KeyedPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for KeyedPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("KeyedPool")
            .field("keys", &self.inner.registry.len())
            .field("stats", &stats)
            .finish()
    }
}

impl<C: Connector> KeyedPool<C> {
    /// Create a pool with the default idle eviction policy.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `config` is invalid, or if it
    /// enables background eviction outside a tokio runtime.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self> {
        Self::with_policy(connector, config, IdleEvictionPolicy)
    }

    /// Create a pool with a custom eviction policy.
    pub fn with_policy(
        connector: C,
        config: PoolConfig,
        policy: impl EvictionPolicy,
    ) -> Result<Self> {
        config.validate()?;
        let period = config.evictor_period();
        let inner = Arc::new(PoolInner {
            lifecycle: Lifecycle::new(connector, config.connect_timeout),
            registry: Registry::new(),
            config,
            policy: Box::new(policy),
            state: Mutex::new(PoolState::new()),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            evictor: Mutex::new(None),
        });

        if let Some(period) = period {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                Error::configuration("background eviction requires a tokio runtime")
            })?;
            let task = runtime.spawn(evictor::run(
                Arc::downgrade(&inner),
                period,
                inner.cancel.clone(),
            ));
            *inner.evictor.lock() = Some(task);
        }

        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        self.inner.lifecycle.connector()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Register or update the config for `config.key()`.
    ///
    /// A changed secret makes every existing connection for the key stale:
    /// idle ones are destroyed when next touched, borrowed ones on return.
    pub fn register(&self, config: ConnectionConfig) -> RegisterOutcome {
        let key = config.key().to_owned();
        let outcome = self.inner.registry.set(config);
        match outcome {
            RegisterOutcome::Unchanged => {}
            RegisterOutcome::Inserted | RegisterOutcome::Replaced => {
                info!(key = %key, ?outcome, "connection config registered");
                self.inner.events.emit(PoolEvent::ConfigChanged { key, outcome });
            }
        }
        outcome
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.registry.contains(key)
    }

    /// Borrow a connection for `key`.
    ///
    /// Prefers a valid idle slot, otherwise opens a new connection if the
    /// caps allow, otherwise waits up to `max_wait` for capacity (or fails
    /// at once when `block_when_exhausted` is off).
    ///
    /// # Errors
    /// - [`Error::ConfigNotFound`] if nothing is registered under `key`
    /// - [`Error::Exhausted`] if no capacity became available in time
    /// - [`Error::Create`] if opening a new connection failed
    /// - [`Error::ShuttingDown`] after [`close`](Self::close)
    pub async fn borrow(&self, key: &str) -> Result<Pooled<C>> {
        let inner = &self.inner;
        let started = Instant::now();
        // A wait too long to represent is no deadline at all.
        let deadline = inner
            .config
            .max_wait
            .and_then(|wait| started.checked_add(wait));
        let key: Arc<str> = Arc::from(key);

        loop {
            let registration = inner
                .registry
                .get(&key)
                .ok_or_else(|| Error::config_not_found(&*key))?;

            // Enabled before looking at the state so a wake between the
            // attempt and the await is not lost.
            let notify = Arc::clone(&inner.state.lock().key_mut(&key).notify);
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            match self.try_acquire(&key, &registration, started).await? {
                Attempt::Ready(conn) => return Ok(conn),
                Attempt::Full(err) => return Err(err),
                Attempt::Wait(mut waiter) => {
                    let woken = match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
                        None => {
                            notified.await;
                            true
                        }
                    };
                    waiter.woken = woken;
                    drop(waiter);
                    if !woken {
                        return Err(self.timed_out(&key, started));
                    }
                }
            }
        }
    }

    /// Register `config` and borrow a connection for it in one call.
    pub async fn borrow_with(&self, config: ConnectionConfig) -> Result<Pooled<C>> {
        let key = config.key().to_owned();
        self.register(config);
        self.borrow(&key).await
    }

    /// One pass over the idle queue and the caps for `key`.
    async fn try_acquire<'a>(
        &'a self,
        key: &Arc<str>,
        registration: &Registration,
        started: Instant,
    ) -> Result<Attempt<'a, C>> {
        let inner = &*self.inner;
        // Bounds the number of idle slots examined, so a queue of stale
        // slots cannot keep this loop busy while others keep returning.
        let mut idle_budget = None;

        loop {
            let step = {
                let mut state = inner.state.lock();
                if state.closed {
                    return Err(Error::ShuttingDown);
                }
                let ks = state.key_mut(key);
                let budget = idle_budget.get_or_insert(ks.idle.len());
                if *budget > 0
                    && let Some(slot) = ks.pop_idle(inner.config.lifo)
                {
                    *budget -= 1;
                    ks.pending += 1;
                    Step::Idle(slot, Reservation::counted(inner, Arc::clone(key)))
                } else if state.can_create(key, &inner.config) {
                    state.key_mut(key).pending += 1;
                    Step::Create(Reservation::counted(inner, Arc::clone(key)))
                } else if let Some((victim_key, victim)) =
                    state.reclaim_candidate(key, &inner.config)
                {
                    let vks = state.key_mut(&victim_key);
                    match vks.remove_idle(victim) {
                        Some(slot) => {
                            vks.pending += 1;
                            Step::Reclaim(slot, Reservation::counted(inner, victim_key))
                        }
                        None => Step::Retry,
                    }
                } else {
                    let ks = state.key_mut(key);
                    if !ks.idle.is_empty() {
                        // Slots came back after the budget was taken.
                        idle_budget = None;
                        Step::Retry
                    } else if inner.config.block_when_exhausted {
                        ks.waiters += 1;
                        Step::Wait(WaiterGuard {
                            inner,
                            key: Arc::clone(key),
                            woken: false,
                        })
                    } else {
                        Step::Full {
                            active: ks.active(),
                            idle: ks.idle.len(),
                            waiters: ks.waiters,
                        }
                    }
                }
            };

            match step {
                Step::Idle(slot, reservation) => {
                    if let Some(conn) = self.activate(slot, reservation, registration, started).await {
                        return Ok(Attempt::Ready(conn));
                    }
                }
                Step::Create(reservation) => {
                    return self
                        .create(reservation, registration, started)
                        .await
                        .map(Attempt::Ready);
                }
                Step::Reclaim(slot, reservation) => {
                    debug!(key = %key, victim = slot.key(), "reclaiming idle slot of another key");
                    inner.destroy(slot, reservation, DestroyReason::Reclaimed).await;
                }
                Step::Wait(waiter) => return Ok(Attempt::Wait(waiter)),
                Step::Retry => {}
                Step::Full {
                    active,
                    idle,
                    waiters,
                } => {
                    inner.events.emit(PoolEvent::Exhausted {
                        key: key.to_string(),
                        waiters,
                    });
                    return Ok(Attempt::Full(Error::Exhausted {
                        key: key.to_string(),
                        active,
                        idle,
                        max_per_key: inner.config.max_total_per_key,
                        waited: None,
                    }));
                }
            }
        }
    }

    /// Validate an idle slot and lend it, or destroy it.
    async fn activate(
        &self,
        slot: Slot<C::Connection>,
        reservation: Reservation<'_, C>,
        registration: &Registration,
        started: Instant,
    ) -> Option<Pooled<C>> {
        let inner = &self.inner;
        if slot.generation() != registration.generation() {
            inner.destroy(slot, reservation, DestroyReason::StaleConfig).await;
            return None;
        }
        if inner.config.validate_on_borrow && !inner.lifecycle.is_alive(slot.conn()).await {
            inner.record_validation_failure(slot.key_arc());
            inner.destroy(slot, reservation, DestroyReason::ValidationFailed).await;
            return None;
        }
        Some(self.lend(slot, reservation, started))
    }

    /// Open a new connection under a reservation and lend it.
    async fn create(
        &self,
        reservation: Reservation<'_, C>,
        registration: &Registration,
        started: Instant,
    ) -> Result<Pooled<C>> {
        let inner = &self.inner;
        let key = Arc::clone(reservation.key());
        let conn = match inner.lifecycle.create(registration).await {
            Ok(conn) => conn,
            Err(err) => {
                inner.state.lock().key_mut(&key).counters.create_failures += 1;
                warn!(key = %key, error = %err, "failed to create connection");
                drop(reservation);
                return Err(Error::create(&*key, err));
            }
        };

        let slot = Slot::new(Arc::clone(&key), registration.generation(), conn);
        inner.record_created(&slot);
        if inner.config.validate_on_create && !inner.lifecycle.is_alive(slot.conn()).await {
            inner.record_validation_failure(&key);
            inner.destroy(slot, reservation, DestroyReason::ValidationFailed).await;
            return Err(Error::create(&*key, ConnectError::NotAlive));
        }
        Ok(self.lend(slot, reservation, started))
    }

    fn lend(
        &self,
        mut slot: Slot<C::Connection>,
        reservation: Reservation<'_, C>,
        started: Instant,
    ) -> Pooled<C> {
        let now = Instant::now();
        {
            let mut state = self.inner.state.lock();
            reservation.settle(&mut state);
            let ks = state.key_mut(slot.key_arc());
            ks.checked_out.insert(
                slot.id(),
                Checkout {
                    borrowed_at: now,
                    abandoned: false,
                },
            );
            ks.counters.borrowed += 1;
        }
        slot.mark_allocated();

        let waited = now.saturating_duration_since(started);
        debug!(key = slot.key(), slot = %slot.id(), ?waited, "connection borrowed");
        self.inner.events.emit(PoolEvent::Borrowed {
            key: slot.key().to_owned(),
            slot: slot.id(),
            waited,
        });
        Pooled::new(Arc::clone(&self.inner), slot)
    }

    fn timed_out(&self, key: &Arc<str>, started: Instant) -> Error {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Error::ShuttingDown;
        }
        let ks = state.key_mut(key);
        ks.counters.timeouts += 1;
        let (active, idle, waiters) = (ks.active(), ks.idle.len(), ks.waiters);
        drop(state);

        let waited = started.elapsed();
        debug!(key = %key, ?waited, "borrow timed out");
        self.inner.events.emit(PoolEvent::Exhausted {
            key: key.to_string(),
            waiters,
        });
        Error::Exhausted {
            key: key.to_string(),
            active,
            idle,
            max_per_key: self.inner.config.max_total_per_key,
            waited: Some(waited),
        }
    }

    /// Hand a borrowed connection back.
    ///
    /// The connection is reset to its key's base path and probed; if it
    /// fails either step, its config asks for auto-discard, or the key's
    /// idle queue is full, it is destroyed instead of recycled. Releasing a
    /// connection that was already invalidated is a no-op.
    ///
    /// The connection always goes back to the pool it was borrowed from,
    /// even when handed to another pool's `release`.
    pub async fn release(&self, mut conn: Pooled<C>) {
        let origin = Arc::clone(conn.origin());
        if let Some(slot) = conn.take_slot() {
            if !Arc::ptr_eq(&origin, &self.inner) {
                debug!(key = slot.key(), slot = %slot.id(), "returning connection to the pool that lent it");
            }
            origin.release(slot).await;
        }
    }

    /// Destroy a borrowed connection instead of recycling it.
    ///
    /// The handle stays with the caller but no longer refers to a
    /// connection; a later [`release`](Self::release) does nothing.
    pub async fn invalidate(&self, conn: &mut Pooled<C>) {
        let origin = Arc::clone(conn.origin());
        if let Some(slot) = conn.take_slot() {
            origin.discard(slot, DestroyReason::Invalidated).await;
        }
    }

    /// Destroy every idle connection for `key`. Borrowed ones are untouched.
    pub async fn clear(&self, key: &str) {
        self.clear_idle(Some(key)).await;
    }

    /// Destroy every idle connection of every key.
    pub async fn clear_all(&self) {
        self.clear_idle(None).await;
    }

    async fn clear_idle(&self, key: Option<&str>) {
        let drained = self.inner.drain_idle(key);
        if !drained.is_empty() {
            info!(key = key.unwrap_or("*"), count = drained.len(), "clearing idle connections");
        }
        for (slot, reservation) in drained {
            self.inner.destroy(slot, reservation, DestroyReason::Cleared).await;
        }
    }

    /// Open idle connections for `key` up to `min_idle_per_key`.
    ///
    /// Returns how many were added.
    pub async fn prepare(&self, key: &str) -> Result<usize> {
        let registration = self
            .inner
            .registry
            .get(key)
            .ok_or_else(|| Error::config_not_found(key))?;
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }
        let key: Arc<str> = Arc::from(key);
        self.inner
            .fill_idle(&key, &registration)
            .await
            .map_err(|err| Error::create(&*key, err))
    }

    /// Run one eviction sweep now, independent of the background schedule.
    pub async fn evict_now(&self) -> SweepReport {
        evictor::sweep(&self.inner).await
    }

    /// Close the pool.
    ///
    /// Stops the evictor, destroys idle connections, and fails current and
    /// future borrowers with [`Error::ShuttingDown`]. Borrowed connections
    /// are destroyed when they come back. Calling it again does nothing.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for ks in state.keys.values() {
                ks.notify.notify_waiters();
            }
        }
        info!("closing connection pool");

        self.inner.cancel.cancel();
        let evictor = self.inner.evictor.lock().take();
        if let Some(handle) = evictor
            && let Err(err) = handle.await
        {
            warn!(error = %err, "evictor task ended abnormally");
        }

        for (slot, reservation) in self.inner.drain_idle(None) {
            self.inner.destroy(slot, reservation, DestroyReason::Shutdown).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Connections currently borrowed, for one key or all of them.
    pub fn active_count(&self, key: Option<&str>) -> usize {
        self.gauge(key, KeyState::active)
    }

    /// Connections currently idle, for one key or all of them.
    pub fn idle_count(&self, key: Option<&str>) -> usize {
        self.gauge(key, |ks| ks.idle.len())
    }

    /// Borrowers currently waiting, for one key or all of them.
    pub fn num_waiters(&self, key: Option<&str>) -> usize {
        self.gauge(key, |ks| ks.waiters)
    }

    fn gauge(&self, key: Option<&str>, read: impl Fn(&KeyState<C::Connection>) -> usize) -> usize {
        let state = self.inner.state.lock();
        match key {
            Some(key) => state.key(key).map_or(0, &read),
            None => state.keys.values().map(&read).sum(),
        }
    }

    /// Statistics aggregated over every key.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().snapshot()
    }

    /// Statistics for one key, if it has ever been used.
    #[must_use]
    pub fn key_stats(&self, key: &str) -> Option<PoolStats> {
        self.inner.state.lock().key(key).map(KeyState::snapshot)
    }

    /// Subscribe to pool events emitted after this call.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::time::Duration;

    fn pool(config: PoolConfig) -> (KeyedPool<MockConnector>, MockConnector) {
        let connector = MockConnector::new();
        let pool = KeyedPool::new(connector.clone(), config).unwrap();
        pool.register(ConnectionConfig::new("h", 22, "u", "pw").with_key("k"));
        (pool, connector)
    }

    #[tokio::test]
    async fn borrow_creates_then_reuses() {
        let (pool, connector) = pool(PoolConfig::default());

        let conn = pool.borrow("k").await.unwrap();
        let first = conn.id();
        pool.release(conn).await;

        let conn = pool.borrow("k").await.unwrap();
        assert_eq!(conn.id(), first);
        assert_eq!(connector.stats().connects, 1);
        pool.release(conn).await;

        let stats = pool.stats();
        assert_eq!(stats.borrowed, 2);
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn unknown_key_is_config_not_found() {
        let (pool, _) = pool(PoolConfig::default());
        let err = pool.borrow("nope").await.unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { key } if key == "nope"));
    }

    #[tokio::test]
    async fn register_reports_outcome() {
        let (pool, _) = pool(PoolConfig::default());
        let mut events = pool.events();

        let same = ConnectionConfig::new("h", 22, "u", "pw").with_key("k");
        assert_eq!(pool.register(same), RegisterOutcome::Unchanged);

        let rotated = ConnectionConfig::new("h", 22, "u", "new").with_key("k");
        assert_eq!(pool.register(rotated), RegisterOutcome::Replaced);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            PoolEvent::ConfigChanged { outcome: RegisterOutcome::Replaced, .. }
        ));
    }

    #[tokio::test]
    async fn create_failure_frees_capacity() {
        let (pool, connector) = pool(PoolConfig::default().with_max_total_per_key(1));
        connector.fail_next_connects(1);

        let err = pool.borrow("k").await.unwrap_err();
        assert!(matches!(err, Error::Create { .. }));
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(pool.stats().create_failures, 1);

        let conn = pool.borrow("k").await.unwrap();
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn max_idle_destroys_surplus_returns() {
        let (pool, connector) = pool(PoolConfig::default().with_max_idle_per_key(1));
        let a = pool.borrow("k").await.unwrap();
        let b = pool.borrow("k").await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        assert_eq!(pool.idle_count(Some("k")), 1);
        assert_eq!(connector.stats().live, 1);
    }

    #[tokio::test]
    async fn failed_reset_destroys_connection() {
        let (pool, connector) = pool(PoolConfig::default());
        let conn = pool.borrow("k").await.unwrap();
        connector.fail_resets(true);
        pool.release(conn).await;

        assert_eq!(pool.idle_count(None), 0);
        assert_eq!(connector.stats().live, 0);
    }

    #[tokio::test]
    async fn dead_idle_slot_is_replaced_on_borrow() {
        let (pool, connector) = pool(PoolConfig::default());
        let conn = pool.borrow("k").await.unwrap();
        let first = conn.id();
        pool.release(conn).await;
        connector.kill(first);

        let conn = pool.borrow("k").await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(pool.stats().validation_failures, 1);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn validate_on_create_rejects_dead_connection() {
        #[derive(Clone)]
        struct DeadOnArrival(MockConnector);

        impl Connector for DeadOnArrival {
            type Connection = crate::testing::MockConnection;

            async fn connect(
                &self,
                config: &ConnectionConfig,
            ) -> std::result::Result<Self::Connection, ConnectError> {
                let conn = self.0.connect(config).await?;
                conn.kill();
                Ok(conn)
            }

            async fn default_dir(
                &self,
                conn: &mut Self::Connection,
            ) -> std::result::Result<String, ConnectError> {
                self.0.default_dir(conn).await
            }

            async fn is_alive(&self, conn: &Self::Connection) -> bool {
                self.0.is_alive(conn).await
            }

            async fn reset(
                &self,
                conn: &mut Self::Connection,
                path: &str,
            ) -> std::result::Result<(), ConnectError> {
                self.0.reset(conn, path).await
            }

            async fn terminate(&self, conn: Self::Connection) -> std::result::Result<(), ConnectError> {
                self.0.terminate(conn).await
            }
        }

        let mock = MockConnector::new();
        let pool = KeyedPool::new(
            DeadOnArrival(mock.clone()),
            PoolConfig::default().with_validate_on_create(true),
        )
        .unwrap();
        pool.register(ConnectionConfig::new("h", 22, "u", "pw").with_key("k"));

        let err = pool.borrow("k").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Create { source: ConnectError::NotAlive, .. }
        ));
        assert_eq!(mock.stats().live, 0);
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test]
    async fn prepare_fills_to_min_idle() {
        let (pool, connector) = pool(PoolConfig::default().with_min_idle_per_key(3));
        assert_eq!(pool.prepare("k").await.unwrap(), 3);
        assert_eq!(pool.idle_count(Some("k")), 3);
        assert_eq!(pool.prepare("k").await.unwrap(), 0);
        assert_eq!(connector.stats().connects, 3);

        assert!(matches!(
            pool.prepare("missing").await,
            Err(Error::ConfigNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn clear_only_touches_idle() {
        let (pool, connector) = pool(PoolConfig::default());
        let held = pool.borrow("k").await.unwrap();
        let idle = pool.borrow("k").await.unwrap();
        pool.release(idle).await;

        pool.clear("k").await;
        assert_eq!(pool.idle_count(Some("k")), 0);
        assert_eq!(pool.active_count(Some("k")), 1);
        assert_eq!(connector.stats().live, 1);

        pool.release(held).await;
        assert_eq!(pool.idle_count(Some("k")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_by_release() {
        let (pool, _) = pool(
            PoolConfig::default()
                .with_max_total_per_key(1)
                .with_max_wait(Some(Duration::from_secs(5))),
        );
        let held = pool.borrow("k").await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow("k").await.map(|conn| conn.id()) })
        };
        while pool.num_waiters(Some("k")) == 0 {
            tokio::task::yield_now().await;
        }

        pool.release(held).await;
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
        assert_eq!(pool.num_waiters(None), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_borrows() {
        let (pool, connector) = pool(PoolConfig::default());
        let conn = pool.borrow("k").await.unwrap();
        let idle = pool.borrow("k").await.unwrap();
        pool.release(idle).await;

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.borrow("k").await, Err(Error::ShuttingDown)));
        assert_eq!(connector.stats().live, 1);

        pool.release(conn).await;
        assert_eq!(connector.stats().live, 0);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn evictor_requires_runtime() {
        let config = PoolConfig::default().with_eviction_interval(Some(Duration::from_secs(1)));
        let err = KeyedPool::new(MockConnector::new(), config).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}

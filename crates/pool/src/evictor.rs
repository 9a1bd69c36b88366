//! Background eviction of idle connections.
//!
//! Each sweep examines up to `eviction_sample_size` of the longest-idle
//! slots across all keys. A slot the [`EvictionPolicy`] selects is
//! destroyed; a slot it spares is probed and destroyed if dead. The sweep
//! then flags checkouts held past `abandon_timeout` and tops idle queues
//! back up to `min_idle_per_key`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::DestroyReason;
use crate::lifecycle::Connector;
use crate::pool::{PoolConfig, PoolInner, Reservation};
use crate::slot::{Slot, SlotId};

/// What an [`EvictionPolicy`] knows about one idle slot.
#[derive(Debug, Clone, Copy)]
pub struct EvictionContext<'a> {
    /// Key of the slot's endpoint.
    pub key: &'a str,
    /// Time since the slot was last returned.
    pub idle_for: Duration,
    /// Time since the connection was opened.
    pub age: Duration,
    /// Idle slots the key holds right now, this one included.
    pub idle_count: usize,
    /// The pool's configuration.
    pub config: &'a PoolConfig,
}

/// Decides whether an idle slot should be evicted.
///
/// Plain functions and closures of the right shape implement this too.
pub trait EvictionPolicy: Send + Sync + 'static {
    fn evict(&self, ctx: &EvictionContext<'_>) -> bool;
}

impl<F> EvictionPolicy for F
where
    F: Fn(&EvictionContext<'_>) -> bool + Send + Sync + 'static,
{
    fn evict(&self, ctx: &EvictionContext<'_>) -> bool {
        self(ctx)
    }
}

/// Two-threshold idle policy.
///
/// Past `hard_idle_threshold` a slot is always evicted. Past
/// `soft_idle_threshold` it is evicted only while its key holds more than
/// `min_idle_per_key` idle slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleEvictionPolicy;

impl EvictionPolicy for IdleEvictionPolicy {
    fn evict(&self, ctx: &EvictionContext<'_>) -> bool {
        let config = ctx.config;
        let hard = config
            .hard_idle_threshold
            .is_some_and(|threshold| ctx.idle_for > threshold);
        let soft = config
            .soft_idle_threshold
            .is_some_and(|threshold| ctx.idle_for > threshold)
            && ctx.idle_count > config.min_idle_per_key;
        hard || soft
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub evicted: usize,
    pub failed_validation: usize,
    pub abandoned: usize,
    pub created: usize,
}

impl SweepReport {
    fn is_idle(&self) -> bool {
        self.evicted + self.failed_validation + self.abandoned + self.created == 0
    }
}

/// Evictor loop. Exits on cancellation or once the pool is gone.
pub(crate) async fn run<C: Connector>(
    pool: Weak<PoolInner<C>>,
    period: Duration,
    cancel: CancellationToken,
) {
    debug!(?period, "evictor started");
    loop {
        tokio::select! {
            () = tokio::time::sleep(period) => {}
            () = cancel.cancelled() => break,
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };
        let report = sweep(&inner).await;
        if !report.is_idle() {
            debug!(?report, "eviction sweep");
        }
    }
    debug!("evictor stopped");
}

enum Verdict<'a, C: Connector> {
    Destroy(Slot<C::Connection>, Reservation<'a, C>, DestroyReason),
    Probe(Slot<C::Connection>, Reservation<'a, C>),
}

/// Run one eviction pass.
pub(crate) async fn sweep<C: Connector>(inner: &PoolInner<C>) -> SweepReport {
    let mut report = SweepReport::default();
    let now = Instant::now();

    for (key, id) in oldest_idle(inner) {
        let Some(verdict) = judge(inner, &key, id, now) else {
            continue;
        };
        report.examined += 1;
        match verdict {
            Verdict::Destroy(slot, reservation, reason) => {
                report.evicted += 1;
                inner.destroy(slot, reservation, reason).await;
            }
            Verdict::Probe(slot, reservation) => {
                if inner.lifecycle.is_alive(slot.conn()).await {
                    restore(inner, slot, reservation).await;
                } else {
                    report.failed_validation += 1;
                    inner.record_validation_failure(&key);
                    inner
                        .destroy(slot, reservation, DestroyReason::ValidationFailed)
                        .await;
                }
            }
        }
    }

    report.abandoned = flag_abandoned(inner, now);
    report.created = top_up(inner).await;
    report
}

/// The longest-idle slots across all keys, oldest first.
fn oldest_idle<C: Connector>(inner: &PoolInner<C>) -> Vec<(Arc<str>, SlotId)> {
    let state = inner.state.lock();
    if state.closed {
        return Vec::new();
    }
    let mut candidates: Vec<_> = state
        .keys
        .iter()
        .flat_map(|(key, ks)| {
            ks.idle
                .iter()
                .map(move |slot| (slot.idle_since(), Arc::clone(key), slot.id()))
        })
        .collect();
    candidates.sort_by_key(|(idle_since, _, _)| *idle_since);
    candidates
        .into_iter()
        .take(inner.config.eviction_sample_size)
        .map(|(_, key, id)| (key, id))
        .collect()
}

/// Take a candidate out of its idle queue if it must be destroyed or probed.
///
/// Returns `None` if a borrower got to it first.
fn judge<'a, C: Connector>(
    inner: &'a PoolInner<C>,
    key: &Arc<str>,
    id: SlotId,
    now: Instant,
) -> Option<Verdict<'a, C>> {
    let mut state = inner.state.lock();
    if state.closed {
        return None;
    }
    let ks = state.keys.get_mut(key)?;
    let slot = ks.idle.iter().find(|slot| slot.id() == id)?;

    let stale = inner
        .registry
        .get(key)
        .is_none_or(|registration| registration.generation() != slot.generation());
    let ctx = EvictionContext {
        key,
        idle_for: slot.idle_for(now),
        age: now.saturating_duration_since(slot.created_at()),
        idle_count: ks.idle.len(),
        config: &inner.config,
    };
    let reason = if stale {
        Some(DestroyReason::StaleConfig)
    } else if inner.policy.evict(&ctx) {
        Some(DestroyReason::Evicted)
    } else {
        None
    };

    let mut slot = ks.remove_idle(id)?;
    ks.pending += 1;
    let reservation = Reservation::counted(inner, Arc::clone(key));
    Some(match reason {
        Some(reason) => Verdict::Destroy(slot, reservation, reason),
        None => {
            slot.mark_evicting();
            Verdict::Probe(slot, reservation)
        }
    })
}

/// Put a slot that passed its probe back in idle order.
async fn restore<C: Connector>(
    inner: &PoolInner<C>,
    mut slot: Slot<C::Connection>,
    reservation: Reservation<'_, C>,
) {
    let rejected = {
        let mut state = inner.state.lock();
        if state.closed {
            Some((slot, reservation))
        } else {
            slot.restore_idle();
            let key = Arc::clone(slot.key_arc());
            state.key_mut(&key).reinsert_idle(slot);
            reservation.settle(&mut state);
            inner.wake(&state, &key);
            None
        }
    };
    if let Some((slot, reservation)) = rejected {
        inner.destroy(slot, reservation, DestroyReason::Shutdown).await;
    }
}

/// Stop counting checkouts held past `abandon_timeout` against capacity.
fn flag_abandoned<C: Connector>(inner: &PoolInner<C>, now: Instant) -> usize {
    let Some(timeout) = inner.config.abandon_timeout else {
        return 0;
    };
    let mut state = inner.state.lock();
    let mut flagged = Vec::new();
    for (key, ks) in &mut state.keys {
        for (id, checkout) in &mut ks.checked_out {
            if !checkout.abandoned && now.saturating_duration_since(checkout.borrowed_at) > timeout {
                checkout.abandoned = true;
                warn!(key = %key, slot = %id, ?timeout, "connection abandoned by borrower");
                flagged.push(Arc::clone(key));
            }
        }
    }
    for key in &flagged {
        inner.wake(&state, key);
    }
    flagged.len()
}

/// Refill every key that has been used to its idle floor.
async fn top_up<C: Connector>(inner: &PoolInner<C>) -> usize {
    if inner.config.min_idle_per_key == 0 {
        return 0;
    }
    let keys: Vec<Arc<str>> = inner.state.lock().keys.keys().cloned().collect();
    let mut created = 0;
    for key in keys {
        let Some(registration) = inner.registry.get(&key) else {
            continue;
        };
        match inner.fill_idle(&key, &registration).await {
            Ok(added) => created += added,
            Err(err) => warn!(key = %key, error = %err, "failed to refill idle connections"),
        }
    }
    created
}

//! Pooled slot: one live connection plus the pool's bookkeeping.
//!
//! A slot is owned by exactly one party at a time (the idle queue, a
//! borrower, or the evictor), so its state travels with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

/// Unique id of a slot within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Pool-visible state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Sitting in its key's idle queue.
    Idle,
    /// Checked out by a borrower.
    Allocated,
    /// Taken out of the idle queue by the evictor.
    Evicting,
    /// Failed validation; about to be destroyed.
    Invalid,
    /// Held by a borrower past the abandon timeout.
    Abandoned,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Allocated => "allocated",
            Self::Evicting => "evicting",
            Self::Invalid => "invalid",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// One live connection wrapped with pool bookkeeping.
#[derive(Debug)]
pub struct Slot<T> {
    id: SlotId,
    key: Arc<str>,
    generation: u64,
    state: SlotState,
    created_at: Instant,
    idle_since: Option<Instant>,
    borrow_count: u64,
    conn: T,
}

impl<T> Slot<T> {
    /// Wrap a freshly created connection. New slots start out allocated.
    pub(crate) fn new(key: Arc<str>, generation: u64, conn: T) -> Self {
        Self {
            id: SlotId::next(),
            key,
            generation,
            state: SlotState::Allocated,
            created_at: Instant::now(),
            idle_since: None,
            borrow_count: 0,
            conn,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn key_arc(&self) -> &Arc<str> {
        &self.key
    }

    /// Registration generation the connection was created under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the slot last became idle. `None` while checked out.
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    /// How long the slot has been idle at `now`.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        self.idle_since
            .map_or(std::time::Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    pub fn borrow_count(&self) -> u64 {
        self.borrow_count
    }

    pub fn conn(&self) -> &T {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut T {
        &mut self.conn
    }

    pub(crate) fn into_conn(self) -> T {
        self.conn
    }

    pub(crate) fn mark_idle(&mut self, now: Instant) {
        self.state = SlotState::Idle;
        self.idle_since = Some(now);
    }

    pub(crate) fn mark_allocated(&mut self) {
        self.state = SlotState::Allocated;
        self.idle_since = None;
        self.borrow_count += 1;
    }

    pub(crate) fn mark_evicting(&mut self) {
        self.state = SlotState::Evicting;
    }

    /// Put an evicted-then-validated slot back without touching `idle_since`.
    pub(crate) fn restore_idle(&mut self) {
        self.state = SlotState::Idle;
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.state = SlotState::Invalid;
    }

    pub(crate) fn mark_abandoned(&mut self) {
        self.state = SlotState::Abandoned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn slot() -> Slot<&'static str> {
        Slot::new(Arc::from("k"), 1, "conn")
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(slot().id(), slot().id());
    }

    #[test]
    fn new_slot_is_allocated() {
        let slot = slot();
        assert_eq!(slot.state(), SlotState::Allocated);
        assert!(slot.idle_since().is_none());
        assert_eq!(slot.borrow_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_then_allocated_clears_timestamp() {
        let mut slot = slot();
        slot.mark_idle(Instant::now());
        assert_eq!(slot.state(), SlotState::Idle);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(slot.idle_for(Instant::now()), Duration::from_secs(5));

        slot.mark_allocated();
        assert_eq!(slot.state(), SlotState::Allocated);
        assert!(slot.idle_since().is_none());
        assert_eq!(slot.idle_for(Instant::now()), Duration::ZERO);
        assert_eq!(slot.borrow_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_keeps_idle_timestamp() {
        let mut slot = slot();
        let since = Instant::now();
        slot.mark_idle(since);
        slot.mark_evicting();
        assert_eq!(slot.state(), SlotState::Evicting);
        slot.restore_idle();
        assert_eq!(slot.state(), SlotState::Idle);
        assert_eq!(slot.idle_since(), Some(since));
    }

    #[test]
    fn display() {
        assert_eq!(SlotState::Evicting.to_string(), "evicting");
        let slot = slot();
        assert!(slot.id().to_string().starts_with("slot-"));
    }
}

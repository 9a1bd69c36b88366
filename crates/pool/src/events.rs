//! Event broadcasting for pool observability.
//!
//! Provides [`PoolEvent`] variants emitted as slots move through their
//! lifecycle and an [`EventBus`] backed by `tokio::sync::broadcast`.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::registry::RegisterOutcome;
use crate::slot::SlotId;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted by the keyed pool.
///
/// All variants carry the `key` of the endpoint involved. Subscribers
/// receive cloned copies via [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A connection config was inserted or replaced.
    ConfigChanged {
        /// The endpoint key.
        key: String,
        /// Whether the key was new or its secret changed.
        outcome: RegisterOutcome,
    },
    /// A new connection was opened.
    Created {
        /// The endpoint key.
        key: String,
        /// The slot wrapping the connection.
        slot: SlotId,
    },
    /// A connection was lent to a borrower.
    Borrowed {
        /// The endpoint key.
        key: String,
        /// The slot lent out.
        slot: SlotId,
        /// Time the borrower spent in `borrow`.
        waited: Duration,
    },
    /// A connection came back and was recycled into the idle queue.
    Returned {
        /// The endpoint key.
        key: String,
        /// The slot returned.
        slot: SlotId,
        /// How long the borrower held the connection.
        held: Duration,
    },
    /// A connection was terminated and its slot removed.
    Destroyed {
        /// The endpoint key.
        key: String,
        /// The slot destroyed.
        slot: SlotId,
        /// Why the slot was destroyed.
        reason: DestroyReason,
    },
    /// A borrower found no capacity.
    Exhausted {
        /// The endpoint key.
        key: String,
        /// Number of borrowers waiting for the key.
        waiters: usize,
    },
}

impl PoolEvent {
    /// The endpoint key the event refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::ConfigChanged { key, .. }
            | Self::Created { key, .. }
            | Self::Borrowed { key, .. }
            | Self::Returned { key, .. }
            | Self::Destroyed { key, .. }
            | Self::Exhausted { key, .. } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// DestroyReason
// ---------------------------------------------------------------------------

/// Reason a slot was permanently removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// The liveness probe failed on borrow, return, or while idle.
    ValidationFailed,
    /// The config asks for connections to be discarded on return.
    AutoDiscard,
    /// The evictor's idle policy selected the slot.
    Evicted,
    /// The caller invalidated the connection.
    Invalidated,
    /// Idle slots were cleared on request.
    Cleared,
    /// The pool is shutting down.
    Shutdown,
    /// The slot was created under a config that has since been replaced.
    StaleConfig,
    /// The key already holds the maximum number of idle slots.
    MaxIdleExceeded,
    /// Resetting the working directory on return failed.
    PassivationFailed,
    /// The borrower held the connection past the abandon timeout.
    Abandoned,
    /// Destroyed to free global capacity for another key.
    Reclaimed,
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ValidationFailed => "validation failed",
            Self::AutoDiscard => "auto discard",
            Self::Evicted => "evicted",
            Self::Invalidated => "invalidated",
            Self::Cleared => "cleared",
            Self::Shutdown => "shutdown",
            Self::StaleConfig => "stale config",
            Self::MaxIdleExceeded => "max idle exceeded",
            Self::PassivationFailed => "passivation failed",
            Self::Abandoned => "abandoned",
            Self::Reclaimed => "reclaimed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for pool events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are silently dropped.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

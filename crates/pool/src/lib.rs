//! # SFTP Connection Pool
//!
//! Keyed pool of authenticated SFTP sessions. Connection configs are
//! registered under a key (by default the `user@host:port` alias); each key
//! gets its own idle queue under shared per-key and global caps. Returned
//! sessions are reset to their base directory and probed before reuse, and
//! an optional background evictor retires idle sessions by a two-threshold
//! policy.
//!
//! The transport is pluggable through [`Connector`]; the pool never touches
//! the wire protocol itself.

pub mod connection;
pub mod error;
pub mod events;
pub mod evictor;
pub mod lifecycle;
pub mod pool;
pub mod pooled;
pub mod registry;
pub mod slot;
pub mod testing;

pub use connection::ConnectionConfig;
pub use error::{ConnectError, Error, Result};
pub use events::{DestroyReason, EventBus, PoolEvent};
pub use evictor::{EvictionContext, EvictionPolicy, IdleEvictionPolicy, SweepReport};
pub use lifecycle::{Connector, Lifecycle};
pub use pool::{KeyedPool, PoolConfig, PoolStats};
pub use pooled::Pooled;
pub use registry::{RegisterOutcome, Registration, Registry};
pub use slot::{SlotId, SlotState};

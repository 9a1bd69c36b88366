//! # SFTP Pool Client
//!
//! Scoped access to pooled SFTP sessions: borrow a connection, run an async
//! closure on it, and hand it back no matter how the closure ends.
//!
//! ```ignore
//! let factory = ClientFactory::from_settings(connector, settings)?;
//! let client = factory.client().await?;
//! let listing = client
//!     .with_connection("outbox", async |sftp| sftp.read_dir(".").await)
//!     .await?;
//! ```

pub mod client;
pub mod factory;
pub mod settings;

pub use client::{Client, KeyedClient};
pub use factory::ClientFactory;
pub use settings::{ConnectionSettings, Settings};

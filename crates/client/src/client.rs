//! Borrow-run-return facade over a [`KeyedPool`].

use std::sync::Arc;
use std::time::Instant;

use sftp_pool::{ConnectionConfig, Connector, KeyedPool, RegisterOutcome};
use tracing::debug;

/// Runs caller work against pooled connections.
///
/// The connection is always handed back to the pool, whether the work
/// succeeds, fails or is cancelled. Whether it is recycled is decided by the
/// pool's return-path checks, not by the outcome of the work.
pub struct Client<C: Connector> {
    pool: KeyedPool<C>,
}

impl<C: Connector> Client<C> {
    pub fn new(pool: KeyedPool<C>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &KeyedPool<C> {
        &self.pool
    }

    /// Register or update the config for `config.key()`.
    pub fn register(&self, config: ConnectionConfig) -> RegisterOutcome {
        self.pool.register(config)
    }

    /// Borrow a connection for `key`, run `f` on it, and return it.
    ///
    /// # Errors
    /// Borrow failures are converted into `E`; otherwise the result of `f`
    /// is returned as is.
    pub async fn with_connection<T, E, F>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: AsyncFnOnce(&mut C::Connection) -> Result<T, E>,
        E: From<sftp_pool::Error>,
    {
        run_on(&self.pool, key, f).await
    }

    /// A client that always uses `key`.
    pub fn bind(&self, key: impl Into<Arc<str>>) -> KeyedClient<C> {
        KeyedClient::new(self.pool.clone(), key)
    }
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

/// A [`Client`] bound to one key.
pub struct KeyedClient<C: Connector> {
    pool: KeyedPool<C>,
    key: Arc<str>,
}

impl<C: Connector> KeyedClient<C> {
    pub fn new(pool: KeyedPool<C>, key: impl Into<Arc<str>>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool(&self) -> &KeyedPool<C> {
        &self.pool
    }

    /// Borrow a connection for the bound key, run `f` on it, and return it.
    pub async fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: AsyncFnOnce(&mut C::Connection) -> Result<T, E>,
        E: From<sftp_pool::Error>,
    {
        run_on(&self.pool, &self.key, f).await
    }
}

impl<C: Connector> Clone for KeyedClient<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            key: Arc::clone(&self.key),
        }
    }
}

impl<C: Connector> std::fmt::Debug for KeyedClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedClient")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// If the caller drops this future mid-`f`, the handle's drop hands the
// connection back.
async fn run_on<C, T, E, F>(pool: &KeyedPool<C>, key: &str, f: F) -> Result<T, E>
where
    C: Connector,
    F: AsyncFnOnce(&mut C::Connection) -> Result<T, E>,
    E: From<sftp_pool::Error>,
{
    let mut conn = pool.borrow(key).await?;
    let started = Instant::now();
    let result = f(&mut *conn).await;
    debug!(
        key = %key,
        slot = %conn.slot_id(),
        ok = result.is_ok(),
        elapsed = ?started.elapsed(),
        "work finished, returning connection"
    );
    pool.release(conn).await;
    result
}

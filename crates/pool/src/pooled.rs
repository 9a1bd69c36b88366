//! RAII handle for borrowed connections

use std::sync::Arc;

use crate::lifecycle::Connector;
use crate::pool::PoolInner;
use crate::slot::{Slot, SlotId};

/// A connection borrowed from a [`KeyedPool`](crate::KeyedPool).
///
/// Dereferences to the connection. Hand it back with
/// [`KeyedPool::release`](crate::KeyedPool::release); if the handle is
/// dropped instead, the release runs on a spawned task.
///
/// # Panics
///
/// Dereferencing panics once the handle has been passed to
/// [`KeyedPool::invalidate`](crate::KeyedPool::invalidate), as do
/// [`key`](Self::key), [`slot_id`](Self::slot_id) and
/// [`borrow_count`](Self::borrow_count). Check [`is_valid`](Self::is_valid)
/// when the handle may have been invalidated.
pub struct Pooled<C: Connector> {
    inner: Arc<PoolInner<C>>,
    slot: Option<Slot<C::Connection>>,
}

impl<C: Connector> Pooled<C> {
    pub(crate) fn new(inner: Arc<PoolInner<C>>, slot: Slot<C::Connection>) -> Self {
        Self {
            inner,
            slot: Some(slot),
        }
    }

    /// Key of the endpoint the connection belongs to.
    pub fn key(&self) -> &str {
        self.slot().key()
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot().id()
    }

    /// How many times the underlying slot has been lent out, this time included.
    pub fn borrow_count(&self) -> u64 {
        self.slot().borrow_count()
    }

    /// Whether the handle still refers to a connection.
    ///
    /// `false` after [`KeyedPool::invalidate`](crate::KeyedPool::invalidate).
    pub fn is_valid(&self) -> bool {
        self.slot.is_some()
    }

    /// The pool that lent this connection.
    pub(crate) fn origin(&self) -> &Arc<PoolInner<C>> {
        &self.inner
    }

    pub(crate) fn take_slot(&mut self) -> Option<Slot<C::Connection>> {
        self.slot.take()
    }

    fn slot(&self) -> &Slot<C::Connection> {
        self.slot.as_ref().expect("connection used after it was invalidated")
    }
}

impl<C: Connector> std::ops::Deref for Pooled<C> {
    type Target = C::Connection;

    fn deref(&self) -> &C::Connection {
        self.slot().conn()
    }
}

impl<C: Connector> std::ops::DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C::Connection {
        self.slot
            .as_mut()
            .expect("connection used after it was invalidated")
            .conn_mut()
    }
}

impl<C: Connector> Drop for Pooled<C> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(&self.inner);
                drop(runtime.spawn(async move { inner.release(slot).await }));
            }
            Err(_) => self.inner.forget(slot),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Pooled");
        match &self.slot {
            Some(slot) => debug
                .field("key", &slot.key())
                .field("slot", &slot.id())
                .field("state", &slot.state()),
            None => debug.field("slot", &"invalidated"),
        };
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::ConnectionConfig;
    use crate::pool::{KeyedPool, PoolConfig};
    use crate::testing::MockConnector;

    async fn pool() -> (KeyedPool<MockConnector>, MockConnector) {
        let connector = MockConnector::new();
        let pool = KeyedPool::new(connector.clone(), PoolConfig::default()).unwrap();
        pool.register(ConnectionConfig::new("h", 22, "u", "pw").with_key("k"));
        (pool, connector)
    }

    #[tokio::test]
    async fn deref_reaches_connection() {
        let (pool, _) = pool().await;
        let mut conn = pool.borrow("k").await.unwrap();
        assert_eq!(conn.key(), "k");
        assert_eq!(conn.borrow_count(), 1);
        conn.set_cwd("/tmp");
        assert_eq!(conn.cwd(), "/tmp");
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn dropped_handle_is_released_in_background() {
        let (pool, connector) = pool().await;
        let conn = pool.borrow("k").await.unwrap();
        drop(conn);

        while pool.idle_count(Some("k")) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.active_count(None), 0);
        assert_eq!(connector.stats().live, 1);
    }

    #[tokio::test]
    async fn invalidated_handle_reports_it() {
        let (pool, _) = pool().await;
        let mut conn = pool.borrow("k").await.unwrap();
        assert!(conn.is_valid());
        pool.invalidate(&mut conn).await;
        assert!(!conn.is_valid());
        assert!(format!("{conn:?}").contains("invalidated"));
    }

    #[tokio::test]
    #[should_panic(expected = "connection used after it was invalidated")]
    async fn deref_after_invalidate_panics() {
        let (pool, _) = pool().await;
        let mut conn = pool.borrow("k").await.unwrap();
        pool.invalidate(&mut conn).await;
        let _ = conn.cwd();
    }
}

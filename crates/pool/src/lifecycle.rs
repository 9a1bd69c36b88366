//! Connection lifecycle: the seam between the pool and the transport.
//!
//! A [`Connector`] knows how to open, probe, reset and close one kind of
//! session. [`Lifecycle`] wraps it with the pool's policy: connect timeout,
//! base path resolution, and terminate that never fails the caller.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::ConnectionConfig;
use crate::error::ConnectError;
use crate::registry::Registration;

/// Transport strategy injected into the pool.
///
/// Implementations own the wire protocol; the pool only ever calls these
/// five operations and never shares a connection between two callers.
pub trait Connector: Send + Sync + 'static {
    /// The live session handed to borrowers.
    type Connection: Send + Sync + 'static;

    /// Open the transport and authenticate.
    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;

    /// The directory the session starts in after login.
    fn default_dir(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<String, ConnectError>> + Send;

    /// Cheap liveness probe. Must return `false` for a dead session, not fail.
    fn is_alive(&self, conn: &Self::Connection) -> impl Future<Output = bool> + Send;

    /// Change the remote working directory.
    fn reset(
        &self,
        conn: &mut Self::Connection,
        path: &str,
    ) -> impl Future<Output = Result<(), ConnectError>> + Send;

    /// Tear the transport down.
    fn terminate(
        &self,
        conn: Self::Connection,
    ) -> impl Future<Output = Result<(), ConnectError>> + Send;
}

/// Pool-side wrapper around a [`Connector`].
#[derive(Debug)]
pub struct Lifecycle<C> {
    connector: C,
    connect_timeout: Option<Duration>,
}

impl<C: Connector> Lifecycle<C> {
    pub fn new(connector: C, connect_timeout: Option<Duration>) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Open a connection for a registration and resolve its base path.
    ///
    /// The first successful create for a key fixes the base path for every
    /// later slot of that key. Two racing first creates resolve the same
    /// default, so losing the race is harmless.
    pub async fn create(&self, registration: &Registration) -> Result<C::Connection, ConnectError> {
        let config = registration.config();
        let connect = self.connector.connect(config);
        let mut conn = match self.connect_timeout {
            Some(after) => tokio::time::timeout(after, connect)
                .await
                .map_err(|_| ConnectError::Timeout { after })??,
            None => connect.await?,
        };

        if registration.base_path().is_none() {
            match self.connector.default_dir(&mut conn).await {
                Ok(dir) => {
                    let resolved = registration.resolve_base_path(dir);
                    debug!(key = registration.key(), base_path = resolved, "resolved base path");
                }
                Err(err) => {
                    self.terminate(registration.key(), conn).await;
                    return Err(err);
                }
            }
        }

        Ok(conn)
    }

    pub async fn is_alive(&self, conn: &C::Connection) -> bool {
        self.connector.is_alive(conn).await
    }

    pub async fn reset(&self, conn: &mut C::Connection, path: &str) -> Result<(), ConnectError> {
        self.connector.reset(conn, path).await
    }

    /// Close a connection. Failures are logged and swallowed.
    pub async fn terminate(&self, key: &str, conn: C::Connection) {
        if let Err(err) = self.connector.terminate(conn).await {
            warn!(key, error = %err, "failed to terminate connection");
        }
    }
}

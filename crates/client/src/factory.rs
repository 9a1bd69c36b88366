//! Lazily built pool shared by every client handed out.

use parking_lot::Mutex;
use sftp_pool::{ConnectionConfig, Connector, Error, KeyedPool, PoolConfig, Result};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::client::{Client, KeyedClient};
use crate::settings::Settings;

/// Owns a connector and its settings, and builds the pool on first use.
///
/// The pool is built exactly once, even when many tasks ask for it at the
/// same time. Building registers the initial connections and pre-fills
/// their idle floor; a key that cannot be reached yet only logs a warning.
pub struct ClientFactory<C: Connector> {
    config: PoolConfig,
    connector: Mutex<Option<C>>,
    initial: Mutex<Vec<ConnectionConfig>>,
    pool: OnceCell<KeyedPool<C>>,
}

impl<C: Connector> ClientFactory<C> {
    /// # Errors
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector: Mutex::new(Some(connector)),
            initial: Mutex::new(Vec::new()),
            pool: OnceCell::new(),
        })
    }

    /// # Errors
    /// Returns [`Error::Configuration`] if any part of `settings` is invalid.
    pub fn from_settings(connector: C, settings: Settings) -> Result<Self> {
        let (config, initial) = settings.into_parts()?;
        let factory = Self::new(connector, config)?;
        *factory.initial.lock() = initial;
        Ok(factory)
    }

    /// Queue a connection to register when the pool is built.
    ///
    /// After the pool exists this registers directly.
    #[must_use]
    pub fn with_connection(self, config: ConnectionConfig) -> Self {
        match self.pool.get() {
            Some(pool) => {
                pool.register(config);
            }
            None => self.initial.lock().push(config),
        }
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_built(&self) -> bool {
        self.pool.initialized()
    }

    /// The shared pool, built on first call.
    ///
    /// # Errors
    /// Returns an error if building the pool fails. A failed build is not
    /// retried.
    pub async fn pool(&self) -> Result<&KeyedPool<C>> {
        self.pool.get_or_try_init(|| self.build()).await
    }

    /// A client over the shared pool.
    pub async fn client(&self) -> Result<Client<C>> {
        Ok(Client::new(self.pool().await?.clone()))
    }

    /// Register `config` and return a client bound to its key.
    pub async fn client_for(&self, config: ConnectionConfig) -> Result<KeyedClient<C>> {
        let pool = self.pool().await?;
        let key = config.key().to_owned();
        pool.register(config);
        Ok(KeyedClient::new(pool.clone(), key))
    }

    /// Close the pool if it was ever built.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    async fn build(&self) -> Result<KeyedPool<C>> {
        let connector = self
            .connector
            .lock()
            .take()
            .ok_or_else(|| Error::configuration("connection pool failed to build earlier"))?;
        let pool = KeyedPool::new(connector, self.config.clone())?;

        let initial = std::mem::take(&mut *self.initial.lock());
        let mut keys = Vec::with_capacity(initial.len());
        for config in initial {
            keys.push(config.key().to_owned());
            pool.register(config);
        }
        for key in &keys {
            if let Err(err) = pool.prepare(key).await {
                warn!(key = %key, error = %err, "could not pre-fill idle connections");
            }
        }

        info!(keys = keys.len(), "connection pool ready");
        Ok(pool)
    }
}

impl<C: Connector> std::fmt::Debug for ClientFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("config", &self.config)
            .field("pool", &self.pool.get())
            .finish()
    }
}

//! Registry of connection configs, one per key.
//!
//! Lookups are lock-free reads of an `Arc`; updates for the same key are
//! serialized by the map shard lock. A registration is never mutated after
//! insertion except for its base path, which is a one-time cell.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::connection::ConnectionConfig;

/// Outcome of [`Registry::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The key was not registered before.
    Inserted,
    /// The secret changed; connections of the previous generation are stale.
    Replaced,
    /// Same key and secret; the existing registration was kept.
    Unchanged,
}

/// A registered config together with pool-side metadata.
#[derive(Debug)]
pub struct Registration {
    config: ConnectionConfig,
    generation: u64,
    base_path: OnceLock<String>,
}

impl Registration {
    fn new(config: ConnectionConfig, generation: u64) -> Self {
        let base_path = OnceLock::new();
        if let Some(path) = config.base_path() {
            let _ = base_path.set(path.to_owned());
        }
        Self {
            config,
            generation,
            base_path,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn key(&self) -> &str {
        self.config.key()
    }

    /// Monotonic id of this registration; bumps when a config is replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Directory recycled connections are reset to, once known.
    pub fn base_path(&self) -> Option<&str> {
        self.base_path.get().map(String::as_str)
    }

    /// Record the connection's default directory as the base path.
    ///
    /// The first caller wins; later calls return the already stored value.
    pub fn resolve_base_path(&self, default_dir: String) -> &str {
        self.base_path.get_or_init(|| default_dir)
    }

    pub fn auto_discard(&self) -> bool {
        self.config.auto_discard()
    }
}

/// Thread-safe map from key to [`Registration`].
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<String, Arc<Registration>>,
    next_generation: AtomicU64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the config for `config.key()`.
    ///
    /// Re-registering with an unchanged secret keeps the existing entry, so a
    /// base path resolved at first connect survives.
    pub fn set(&self, config: ConnectionConfig) -> RegisterOutcome {
        match self.entries.entry(config.key().to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().config.same_secret(&config) {
                    return RegisterOutcome::Unchanged;
                }
                let generation = self.bump();
                occupied.insert(Arc::new(Registration::new(config, generation)));
                RegisterOutcome::Replaced
            }
            Entry::Vacant(vacant) => {
                let generation = self.bump();
                vacant.insert(Arc::new(Registration::new(config, generation)));
                RegisterOutcome::Inserted
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Registration>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

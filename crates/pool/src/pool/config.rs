//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the keyed pool.
///
/// Every option can be set independently, either through struct update
/// syntax or the chainable `with_*` setters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Cap on slots across all keys. `None` means unbounded.
    pub max_total: Option<usize>,
    /// Cap on slots (idle + checked out) per key.
    pub max_total_per_key: usize,
    /// Idle floor per key that soft eviction never goes below.
    pub min_idle_per_key: usize,
    /// Idle ceiling per key; returns beyond it destroy the slot.
    pub max_idle_per_key: usize,
    /// Hand out the most recently idled slot first.
    pub lifo: bool,
    /// Wake waiting borrowers one at a time in arrival order.
    pub fairness: bool,
    /// How long `borrow` may wait. `None` waits forever.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub max_wait: Option<Duration>,
    /// Wait for capacity instead of failing immediately.
    pub block_when_exhausted: bool,
    /// Idle time after which a slot is evicted regardless of the floor.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub hard_idle_threshold: Option<Duration>,
    /// Idle time after which a slot is evicted if the key is above its floor.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub soft_idle_threshold: Option<Duration>,
    /// Period of the background evictor. `None` or zero disables it.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub eviction_interval: Option<Duration>,
    /// Idle slots examined per eviction sweep.
    pub eviction_sample_size: usize,
    /// Probe liveness right after creating a connection.
    pub validate_on_create: bool,
    /// Probe liveness before lending an idle slot.
    pub validate_on_borrow: bool,
    /// Probe liveness before recycling a returned slot.
    pub validate_on_return: bool,
    /// Upper bound on opening one connection.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub connect_timeout: Option<Duration>,
    /// Checkouts held longer than this are treated as abandoned.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub abandon_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: None,
            max_total_per_key: 8,
            min_idle_per_key: 1,
            max_idle_per_key: 8,
            lifo: true,
            fairness: false,
            max_wait: None,
            block_when_exhausted: true,
            hard_idle_threshold: Some(Duration::from_secs(30 * 60)),
            soft_idle_threshold: None,
            eviction_interval: None,
            eviction_sample_size: 3,
            validate_on_create: false,
            validate_on_borrow: true,
            validate_on_return: true,
            connect_timeout: None,
            abandon_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_total_per_key == 0 {
            return Err(Error::configuration(
                "max_total_per_key must be greater than 0",
            ));
        }
        if self.max_total == Some(0) {
            return Err(Error::configuration(
                "max_total must be greater than 0 or unset",
            ));
        }
        if self.min_idle_per_key > self.max_idle_per_key {
            return Err(Error::configuration(format!(
                "min_idle_per_key ({}) must not exceed max_idle_per_key ({})",
                self.min_idle_per_key, self.max_idle_per_key
            )));
        }
        if let (Some(soft), Some(hard)) = (self.soft_idle_threshold, self.hard_idle_threshold)
            && soft > hard
        {
            return Err(Error::configuration(format!(
                "soft_idle_threshold ({soft:?}) must not exceed hard_idle_threshold ({hard:?})"
            )));
        }
        if self.evictor_period().is_some() && self.eviction_sample_size == 0 {
            return Err(Error::configuration(
                "eviction_sample_size must be greater than 0 when eviction is enabled",
            ));
        }
        Ok(())
    }

    /// Effective evictor period; `None` when background eviction is off.
    pub fn evictor_period(&self) -> Option<Duration> {
        self.eviction_interval.filter(|interval| !interval.is_zero())
    }

    /// Whether a new slot fits under the global cap given the current total.
    pub(crate) fn global_headroom(&self, total: usize) -> bool {
        self.max_total.is_none_or(|max| total < max)
    }

    pub fn with_max_total(mut self, max_total: Option<usize>) -> Self {
        self.max_total = max_total;
        self
    }

    pub fn with_max_total_per_key(mut self, max: usize) -> Self {
        self.max_total_per_key = max;
        self
    }

    pub fn with_min_idle_per_key(mut self, min: usize) -> Self {
        self.min_idle_per_key = min;
        self
    }

    pub fn with_max_idle_per_key(mut self, max: usize) -> Self {
        self.max_idle_per_key = max;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_fairness(mut self, fairness: bool) -> Self {
        self.fairness = fairness;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_block_when_exhausted(mut self, block: bool) -> Self {
        self.block_when_exhausted = block;
        self
    }

    pub fn with_hard_idle_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.hard_idle_threshold = threshold;
        self
    }

    pub fn with_soft_idle_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.soft_idle_threshold = threshold;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Option<Duration>) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn with_eviction_sample_size(mut self, size: usize) -> Self {
        self.eviction_sample_size = size;
        self
    }

    pub fn with_validate_on_create(mut self, validate: bool) -> Self {
        self.validate_on_create = validate;
        self
    }

    pub fn with_validate_on_borrow(mut self, validate: bool) -> Self {
        self.validate_on_borrow = validate;
        self
    }

    pub fn with_validate_on_return(mut self, validate: bool) -> Self {
        self.validate_on_return = validate;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_abandon_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.abandon_timeout = timeout;
        self
    }
}

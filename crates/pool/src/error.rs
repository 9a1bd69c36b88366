//! Error types for the keyed connection pool.
//!
//! [`ConnectError`] is what a [`Connector`](crate::lifecycle::Connector)
//! reports about the transport. [`Error`] is what callers of the pool see.

use std::time::Duration;

use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level failure reported by a connector.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The transport could not be opened or broke during an operation
    #[error("Transport error: {message}")]
    Transport {
        /// The error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The endpoint rejected the credentials
    #[error("Authentication failed for '{user}@{host}'")]
    Authentication {
        /// The user name that was rejected
        user: String,
        /// The endpoint host
        host: String,
    },

    /// The operation did not complete in time
    #[error("Operation timed out after {}ms", after.as_millis())]
    Timeout {
        /// The elapsed time budget
        after: Duration,
    },

    /// A freshly created connection failed its liveness probe
    #[error("Connection is not alive")]
    NotAlive,

    /// The connection was already closed
    #[error("Connection closed")]
    Closed,
}

impl ConnectError {
    /// Create a transport error without an underlying source
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error wrapping an underlying source
    pub fn transport_with<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Self::Transport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Check if retrying against the same endpoint may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::NotAlive | Self::Closed => true,
            Self::Authentication { .. } => false,
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        Self::transport_with(err.to_string(), err)
    }
}

/// Error type returned by the keyed pool
#[derive(Error, Debug)]
pub enum Error {
    /// No connection config is registered under the key
    #[error("No connection config registered for key '{key}'")]
    ConfigNotFound {
        /// The requested key
        key: String,
    },

    /// The pool had no capacity for the key within the allowed wait
    #[error(
        "Pool exhausted for '{key}': {active} active, {idle} idle, {max_per_key} max per key"
    )]
    Exhausted {
        /// The requested key
        key: String,
        /// Connections checked out for the key
        active: usize,
        /// Idle connections for the key
        idle: usize,
        /// Configured per-key capacity
        max_per_key: usize,
        /// How long the caller waited, if it waited at all
        waited: Option<Duration>,
    },

    /// Establishing a new connection failed
    #[error("Failed to create connection for '{key}': {source}")]
    Create {
        /// The requested key
        key: String,
        /// The transport-level cause
        #[source]
        source: ConnectError,
    },

    /// The pool has been closed and no longer lends connections
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// The pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a config-not-found error
    pub fn config_not_found<S: Into<String>>(key: S) -> Self {
        Self::ConfigNotFound { key: key.into() }
    }

    /// Create a creation error for a key
    pub fn create<S: Into<String>>(key: S, source: ConnectError) -> Self {
        Self::Create {
            key: key.into(),
            source,
        }
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exhausted { .. } => true,
            Self::Create { source, .. } => source.is_retryable(),
            Self::ConfigNotFound { .. } | Self::ShuttingDown | Self::Configuration { .. } => false,
        }
    }

    /// Get the key associated with this error (if any)
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::ConfigNotFound { key } | Self::Exhausted { key, .. } | Self::Create { key, .. } => {
                Some(key)
            }
            Self::ShuttingDown | Self::Configuration { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_is_retryable() {
        let err = Error::Exhausted {
            key: "k".into(),
            active: 1,
            idle: 0,
            max_per_key: 1,
            waited: None,
        };
        assert!(err.is_retryable());
        assert_eq!(err.key(), Some("k"));
    }

    #[test]
    fn create_inherits_retryability_from_source() {
        let auth = Error::create(
            "k",
            ConnectError::Authentication {
                user: "u".into(),
                host: "h".into(),
            },
        );
        assert!(!auth.is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let transport = Error::create("k", ConnectError::from(io));
        assert!(transport.is_retryable());
    }

    #[test]
    fn shutting_down_has_no_key() {
        assert!(Error::ShuttingDown.key().is_none());
        assert!(!Error::ShuttingDown.is_retryable());
    }

    #[test]
    fn display_mentions_key() {
        let err = Error::config_not_found("backup");
        assert_eq!(
            err.to_string(),
            "No connection config registered for key 'backup'"
        );
    }
}

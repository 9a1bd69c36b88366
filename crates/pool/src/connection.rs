//! Connection parameters for one logical endpoint.

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

/// Parameters needed to (re)create a connection for one key.
///
/// Identity fields are fixed at construction. When no explicit key is set,
/// the key is the alias `user@host:port`.
pub struct ConnectionConfig {
    key: String,
    host: String,
    port: u16,
    user: String,
    secret: SecretString,
    base_path: Option<String>,
    auto_discard: bool,
}

impl ConnectionConfig {
    /// Create a config keyed by its `user@host:port` alias.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let user = user.into();
        Self {
            key: alias(&user, &host, port),
            host,
            port,
            user,
            secret: SecretString::from(secret.into()),
            base_path: None,
            auto_discard: false,
        }
    }

    /// Use an explicit key instead of the alias. Empty keys are ignored.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !key.is_empty() {
            self.key = key;
        }
        self
    }

    /// Directory every recycled connection is reset to.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Destroy connections on return instead of recycling them.
    #[must_use]
    pub fn with_auto_discard(mut self, auto_discard: bool) -> Self {
        self.auto_discard = auto_discard;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// The `user@host:port` alias, independent of the key.
    pub fn alias(&self) -> String {
        alias(&self.user, &self.host, self.port)
    }

    /// The configured base path, if one was given explicitly.
    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    pub fn auto_discard(&self) -> bool {
        self.auto_discard
    }

    /// Constant-time comparison of the secrets of two configs.
    pub fn same_secret(&self, other: &Self) -> bool {
        let a = self.secret.expose_secret().as_bytes();
        let b = other.secret.expose_secret().as_bytes();
        a.ct_eq(b).into()
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("key", &self.key)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("base_path", &self.base_path)
            .field("auto_discard", &self.auto_discard)
            .finish()
    }
}

fn alias(user: &str, host: &str, port: u16) -> String {
    format!("{user}@{host}:{port}")
}

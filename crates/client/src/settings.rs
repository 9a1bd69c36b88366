//! Deserialisable settings for a client factory.
//!
//! Any serde format works; loading the file is left to the application.

use std::collections::BTreeMap;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sftp_pool::{ConnectionConfig, Error, PoolConfig, Result};

/// Pool tuning plus the connections registered at startup.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolConfig,
    /// Connections by key.
    pub connections: BTreeMap<String, ConnectionSettings>,
}

/// One endpoint as it appears in a settings file.
#[derive(Debug, Deserialize)]
pub struct ConnectionSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default, alias = "auto_disconnect")]
    pub auto_discard: bool,
}

const fn default_port() -> u16 {
    22
}

impl ConnectionSettings {
    /// Build the config registered under `key`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when the host or user is empty.
    pub fn to_config(&self, key: &str) -> Result<ConnectionConfig> {
        if self.host.trim().is_empty() {
            return Err(Error::configuration(format!(
                "connection '{key}': host must not be empty"
            )));
        }
        if self.user.is_empty() {
            return Err(Error::configuration(format!(
                "connection '{key}': user must not be empty"
            )));
        }

        let mut config = ConnectionConfig::new(
            self.host.as_str(),
            self.port,
            self.user.as_str(),
            self.password.expose_secret(),
        )
        .with_key(key)
        .with_auto_discard(self.auto_discard);
        if let Some(path) = &self.base_path {
            config = config.with_base_path(path.as_str());
        }
        Ok(config)
    }
}

impl Settings {
    /// Validate the pool section and convert every connection.
    ///
    /// # Errors
    /// Returns the first [`Error::Configuration`] found.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        for (key, connection) in &self.connections {
            connection.to_config(key)?;
        }
        Ok(())
    }

    /// Split into the pool config and the connection configs, in key order.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for an invalid connection entry.
    pub fn into_parts(self) -> Result<(PoolConfig, Vec<ConnectionConfig>)> {
        let configs = self
            .connections
            .iter()
            .map(|(key, connection)| connection.to_config(key))
            .collect::<Result<Vec<_>>>()?;
        Ok((self.pool, configs))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_durations_and_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "pool": { "max_total_per_key": 4, "max_wait": "30s", "eviction_interval": "1m" },
                "connections": {
                    "outbox": { "host": "files.example.com", "user": "deploy", "password": "pw" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.pool.max_total_per_key, 4);
        assert_eq!(settings.pool.max_wait, Some(Duration::from_secs(30)));
        assert_eq!(settings.pool.eviction_interval, Some(Duration::from_secs(60)));
        assert_eq!(settings.pool.min_idle_per_key, PoolConfig::default().min_idle_per_key);

        let outbox = &settings.connections["outbox"];
        assert_eq!(outbox.port, 22);
        assert_eq!(outbox.base_path, None);
        assert!(!outbox.auto_discard);
    }

    #[rstest]
    #[case::current(r#""auto_discard": true"#)]
    #[case::legacy(r#""auto_disconnect": true"#)]
    fn auto_discard_accepts_both_names(#[case] field: &str) {
        let json = format!(r#"{{ "host": "h", "user": "u", "password": "pw", {field} }}"#);
        let connection: ConnectionSettings = serde_json::from_str(&json).unwrap();
        assert!(connection.auto_discard);
    }

    #[test]
    fn map_key_becomes_the_pool_key() {
        let settings: Settings = serde_json::from_str(
            r#"{ "connections": {
                "b": { "host": "h", "port": 2222, "user": "u", "password": "pw", "base_path": "/in" },
                "a": { "host": "h", "user": "u", "password": "pw" }
            } }"#,
        )
        .unwrap();

        let (_, configs) = settings.into_parts().unwrap();
        let keys: Vec<_> = configs.iter().map(|config| config.key()).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(configs[1].port(), 2222);
        assert_eq!(configs[1].base_path(), Some("/in"));
    }

    #[test]
    fn empty_host_is_rejected() {
        let settings: Settings = serde_json::from_str(
            r#"{ "connections": { "x": { "host": " ", "user": "u", "password": "pw" } } }"#,
        )
        .unwrap();
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn password_is_loaded_but_never_printed() {
        let connection: ConnectionSettings =
            serde_json::from_str(r#"{ "host": "h", "user": "u", "password": "hunter2" }"#).unwrap();
        assert_eq!(connection.password.expose_secret(), "hunter2");
        assert!(!format!("{connection:?}").contains("hunter2"));
    }
}

//! Loading [`ConnectionConfig`] from the environment or a JSON file.

use crate::error::{TetherError, TetherResult};
use crate::models::{
    ConnectionConfig, ConnectionOptions, MonitorConfig, ReconnectPolicy, TunnelConfig,
    TunnelCredential,
};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Driver identifier.
pub const ENV_DB_DRIVER: &str = "TETHER_DB_DRIVER";
/// Connection URL or DSN template.
pub const ENV_DB_URL: &str = "TETHER_DB_URL";
/// Connect deadline in seconds.
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "TETHER_CONNECT_TIMEOUT_SECS";
/// Ping deadline in seconds.
pub const ENV_PING_TIMEOUT_SECS: &str = "TETHER_PING_TIMEOUT_SECS";
/// Deadline for a bulk load or verification query, in seconds.
pub const ENV_STATEMENT_TIMEOUT_SECS: &str = "TETHER_STATEMENT_TIMEOUT_SECS";
/// Monitor polling interval in seconds.
pub const ENV_MONITOR_INTERVAL_SECS: &str = "TETHER_MONITOR_INTERVAL_SECS";
/// Upper bound for backoff between reconnects; enables backoff when set.
pub const ENV_MONITOR_BACKOFF_MAX_SECS: &str = "TETHER_MONITOR_BACKOFF_MAX_SECS";
/// SSH username.
pub const ENV_SSH_USER: &str = "TETHER_SSH_USER";
/// SSH server, `host` or `host:port`.
pub const ENV_SSH_SERVER: &str = "TETHER_SSH_SERVER";
/// Forwarding destination, `host:port`.
pub const ENV_SSH_DESTINATION: &str = "TETHER_SSH_DESTINATION";
/// SSH password.
pub const ENV_SSH_PASSWORD: &str = "TETHER_SSH_PASSWORD";
/// SSH private key path.
pub const ENV_SSH_KEY_PATH: &str = "TETHER_SSH_KEY_PATH";
/// Passphrase of the SSH private key.
pub const ENV_SSH_KEY_PASSPHRASE: &str = "TETHER_SSH_KEY_PASSPHRASE";
/// Local tunnel port.
pub const ENV_SSH_LOCAL_PORT: &str = "TETHER_SSH_LOCAL_PORT";

impl ConnectionConfig {
    /// Load from process environment, reading `.env` first if present.
    pub fn from_env() -> TetherResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load a specific env file into the process environment, then read it.
    pub fn from_env_file(path: impl AsRef<Path>) -> TetherResult<Self> {
        let path = path.as_ref();
        dotenvy::from_path(path).map_err(|e| {
            TetherError::config(format!("Failed to load env file {}: {e}", path.display()))
        })?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    ///
    /// Unset and empty values are treated alike.
    pub fn from_lookup<F>(lookup: F) -> TetherResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let driver = get(ENV_DB_DRIVER).unwrap_or_else(|| "postgres".to_string());
        let url = get(ENV_DB_URL)
            .ok_or_else(|| TetherError::config(format!("{ENV_DB_URL} is required")))?;

        let defaults = ConnectionOptions::default();
        let options = ConnectionOptions {
            connect_timeout_secs: parse_or(
                &get,
                ENV_CONNECT_TIMEOUT_SECS,
                defaults.connect_timeout_secs,
            )?,
            ping_timeout_secs: parse_or(&get, ENV_PING_TIMEOUT_SECS, defaults.ping_timeout_secs)?,
            statement_timeout_secs: parse_or(
                &get,
                ENV_STATEMENT_TIMEOUT_SECS,
                defaults.statement_timeout_secs,
            )?,
            application_name: defaults.application_name,
        };

        let mut monitor = MonitorConfig::default();
        if let Some(secs) = parse_opt::<u64>(&get, ENV_MONITOR_INTERVAL_SECS)? {
            monitor = monitor.with_interval(Duration::from_secs(secs));
        }
        if let Some(max_interval_secs) = parse_opt::<u64>(&get, ENV_MONITOR_BACKOFF_MAX_SECS)? {
            monitor = monitor.with_policy(ReconnectPolicy::Backoff { max_interval_secs });
        }

        let mut config = ConnectionConfig::new(&driver, url)?
            .with_options(options)
            .with_monitor(monitor);
        if let Some(tunnel) = tunnel_from_lookup(&get)? {
            config = config.with_tunnel(tunnel);
        }

        config.validate()?;
        tracing::debug!(
            url = %config.display_url(),
            tunnel = config.tunnel.is_some(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> TetherResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TetherError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config: ConnectionConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}

fn tunnel_from_lookup<G>(get: &G) -> TetherResult<Option<TunnelConfig>>
where
    G: Fn(&str) -> Option<String>,
{
    let (user, server, destination) =
        match (get(ENV_SSH_USER), get(ENV_SSH_SERVER), get(ENV_SSH_DESTINATION)) {
            (Some(user), Some(server), Some(destination)) => (user, server, destination),
            (None, None, None) => return Ok(None),
            _ => {
                return Err(TetherError::config(format!(
                    "{ENV_SSH_USER}, {ENV_SSH_SERVER} and {ENV_SSH_DESTINATION} \
                     must be set together"
                )))
            }
        };

    let credential = match (get(ENV_SSH_KEY_PATH), get(ENV_SSH_PASSWORD)) {
        (Some(path), _) => TunnelCredential::KeyFile {
            path: path.into(),
            passphrase: get(ENV_SSH_KEY_PASSPHRASE),
        },
        (None, Some(password)) => TunnelCredential::Password { password },
        (None, None) => {
            return Err(TetherError::config(format!(
                "SSH tunnel requires {ENV_SSH_PASSWORD} or {ENV_SSH_KEY_PATH}"
            )))
        }
    };

    Ok(Some(TunnelConfig {
        user,
        credential,
        server,
        destination,
        local_port: parse_or(get, ENV_SSH_LOCAL_PORT, 0)?,
    }))
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> TetherResult<Option<T>> {
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| TetherError::config(format!("Invalid value for {key}: '{raw}'")))
        })
        .transpose()
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> TetherResult<T> {
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_minimal_env() {
        let config =
            ConnectionConfig::from_lookup(lookup(&[(ENV_DB_URL, "host=db user=app")])).unwrap();
        assert_eq!(config.url, "host=db user=app");
        assert!(config.tunnel.is_none());
        assert_eq!(config.monitor, MonitorConfig::default());
        assert_eq!(config.options, ConnectionOptions::default());
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let err = ConnectionConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.is_config());
        let err = ConnectionConfig::from_lookup(lookup(&[(ENV_DB_URL, "  ")])).unwrap_err();
        assert!(err.to_string().contains(ENV_DB_URL));
    }

    #[test]
    fn test_unsupported_driver_is_rejected() {
        let err = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_DRIVER, "mysql"),
            (ENV_DB_URL, "host=db"),
        ]))
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_timeouts_and_backoff() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_URL, "host=db"),
            (ENV_CONNECT_TIMEOUT_SECS, "3"),
            (ENV_PING_TIMEOUT_SECS, "1"),
            (ENV_STATEMENT_TIMEOUT_SECS, "45"),
            (ENV_MONITOR_INTERVAL_SECS, "5"),
            (ENV_MONITOR_BACKOFF_MAX_SECS, "60"),
        ]))
        .unwrap();
        assert_eq!(config.options.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.options.ping_timeout(), Duration::from_secs(1));
        assert_eq!(config.options.statement_timeout(), Duration::from_secs(45));
        assert_eq!(config.monitor.interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.policy, ReconnectPolicy::Backoff { max_interval_secs: 60 });
    }

    #[test]
    fn test_bad_number_names_the_variable() {
        let err = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_URL, "host=db"),
            (ENV_PING_TIMEOUT_SECS, "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(ENV_PING_TIMEOUT_SECS));
    }

    #[test]
    fn test_tunnel_from_env() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_URL, "host=127.0.0.1 port={tunnel_port}"),
            (ENV_SSH_USER, "deploy"),
            (ENV_SSH_SERVER, "bastion:2222"),
            (ENV_SSH_DESTINATION, "db.internal:5432"),
            (ENV_SSH_PASSWORD, "hunter2"),
            (ENV_SSH_LOCAL_PORT, "6543"),
        ]))
        .unwrap();
        let tunnel = config.tunnel.unwrap();
        assert_eq!(tunnel.local_port, 6543);
        assert!(matches!(tunnel.credential, TunnelCredential::Password { .. }));
    }

    #[test]
    fn test_key_file_takes_precedence() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_URL, "host=db"),
            (ENV_SSH_USER, "deploy"),
            (ENV_SSH_SERVER, "bastion"),
            (ENV_SSH_DESTINATION, "db:5432"),
            (ENV_SSH_PASSWORD, "unused"),
            (ENV_SSH_KEY_PATH, "/keys/id_ed25519"),
        ]))
        .unwrap();
        assert!(matches!(
            config.tunnel.unwrap().credential,
            TunnelCredential::KeyFile { passphrase: None, .. }
        ));
    }

    #[test]
    fn test_partial_tunnel_is_rejected() {
        let err = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_URL, "host=db"),
            (ENV_SSH_USER, "deploy"),
        ]))
        .unwrap_err();
        assert!(err.is_config());

        let err = ConnectionConfig::from_lookup(lookup(&[
            (ENV_DB_URL, "host=db"),
            (ENV_SSH_USER, "deploy"),
            (ENV_SSH_SERVER, "bastion"),
            (ENV_SSH_DESTINATION, "db:5432"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(ENV_SSH_PASSWORD));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.json");
        std::fs::write(
            &path,
            r#"{
                "driver": "postgres",
                "url": "host=db",
                "monitor": {"interval_ms": 500, "policy": {"kind": "fixed"}}
            }"#,
        )
        .unwrap();

        let config = ConnectionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.monitor.interval(), Duration::from_millis(500));

        std::fs::write(&path, r#"{"driver":"postgres","url":""}"#).unwrap();
        assert!(ConnectionConfig::from_json_file(&path).unwrap_err().is_config());

        assert!(ConnectionConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}

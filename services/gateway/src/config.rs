use anyhow::{Context, Result, bail};
use fabgate_events::EventStreamConf;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Gateway configuration sourced from environment variables, with optional
// YAML overrides via FABGATE_CONFIG.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // HTTP bind address for the REST/WebSocket API.
    pub bind_addr: SocketAddr,
    // Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    pub events: EventsSettings,
}

#[derive(Debug, Clone)]
pub struct EventsSettings {
    // Poll cadence of each stream's subscription poller; floor of 1s.
    pub polling_interval_sec: u64,
    pub webhooks_allow_private_ips: bool,
    // Per-stream ceiling on accepted-but-unacked events.
    pub max_in_flight: u64,
    pub storage: StorageBackend,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

impl StorageBackend {
    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" => Ok(Self::Rocksdb),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    events: Option<EventsOverride>,
}

#[derive(Debug, Deserialize)]
struct EventsOverride {
    polling_interval_sec: Option<u64>,
    webhooks_allow_private_ips: Option<bool>,
    max_in_flight: Option<u64>,
    storage: Option<String>,
    db_path: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind_addr = std::env::var("FABGATE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .with_context(|| "parse FABGATE_BIND")?;
        let metrics_bind = std::env::var("FABGATE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse FABGATE_METRICS_BIND")?;
        let polling_interval_sec = match std::env::var("FABGATE_POLLING_INTERVAL_SEC") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| "parse FABGATE_POLLING_INTERVAL_SEC")?
                .max(1),
            Err(_) => 1,
        };
        let webhooks_allow_private_ips = std::env::var("FABGATE_WEBHOOKS_ALLOW_PRIVATE_IPS")
            .map(|value| value == "true")
            .unwrap_or(false);
        let max_in_flight = match std::env::var("FABGATE_MAX_IN_FLIGHT") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| "parse FABGATE_MAX_IN_FLIGHT")?,
            Err(_) => 10_000,
        };
        let storage = match std::env::var("FABGATE_STORAGE") {
            Ok(value) => StorageBackend::parse(&value)?,
            Err(_) => StorageBackend::Rocksdb,
        };
        let db_path = std::env::var("FABGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/fabgate-events"));
        Ok(Self {
            bind_addr,
            metrics_bind,
            events: EventsSettings {
                polling_interval_sec,
                webhooks_allow_private_ips,
                max_in_flight,
                storage,
                db_path,
            },
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FABGATE_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FABGATE_CONFIG: {path}"))?;
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(events) = override_cfg.events {
                if let Some(value) = events.polling_interval_sec {
                    config.events.polling_interval_sec = value.max(1);
                }
                if let Some(value) = events.webhooks_allow_private_ips {
                    config.events.webhooks_allow_private_ips = value;
                }
                if let Some(value) = events.max_in_flight {
                    config.events.max_in_flight = value;
                }
                if let Some(value) = events.storage {
                    config.events.storage = StorageBackend::parse(&value)?;
                }
                if let Some(value) = events.db_path {
                    config.events.db_path = PathBuf::from(value);
                }
            }
        }
        Ok(config)
    }

    pub fn event_stream_conf(&self) -> EventStreamConf {
        EventStreamConf {
            polling_interval: Duration::from_secs(self.events.polling_interval_sec),
            webhooks_allow_private_ips: self.events.webhooks_allow_private_ips,
            max_in_flight: self.events.max_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    // Helper to clear all fabgate env vars
    fn clear_fabgate_env() {
        let keys: Vec<String> = env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("FABGATE_"))
            .collect();
        for key in keys {
            env::remove_var(key);
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_fabgate_env();
        let config = GatewayConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:3000");
        assert_eq!(config.metrics_bind.to_string(), "0.0.0.0:8080");
        assert_eq!(config.events.polling_interval_sec, 1);
        assert!(!config.events.webhooks_allow_private_ips);
        assert_eq!(config.events.storage, StorageBackend::Rocksdb);
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_fabgate_env();
        env::set_var("FABGATE_BIND", "127.0.0.1:9000");
        env::set_var("FABGATE_POLLING_INTERVAL_SEC", "5");
        env::set_var("FABGATE_WEBHOOKS_ALLOW_PRIVATE_IPS", "true");
        env::set_var("FABGATE_STORAGE", "memory");

        let config = GatewayConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.events.polling_interval_sec, 5);
        assert!(config.events.webhooks_allow_private_ips);
        assert_eq!(config.events.storage, StorageBackend::Memory);

        clear_fabgate_env();
    }

    #[serial]
    #[test]
    fn polling_interval_has_a_floor_of_one_second() {
        clear_fabgate_env();
        env::set_var("FABGATE_POLLING_INTERVAL_SEC", "0");
        let config = GatewayConfig::from_env().expect("from_env");
        assert_eq!(config.events.polling_interval_sec, 1);
        clear_fabgate_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_invalid_socket_addr() {
        clear_fabgate_env();
        env::set_var("FABGATE_BIND", "not-a-valid-address");
        assert!(GatewayConfig::from_env().is_err());
        clear_fabgate_env();
    }

    #[serial]
    #[test]
    fn unknown_storage_backend_fails() {
        clear_fabgate_env();
        env::set_var("FABGATE_STORAGE", "stone-tablets");
        assert!(GatewayConfig::from_env().is_err());
        clear_fabgate_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_overrides_with_valid_yaml() {
        clear_fabgate_env();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("config.yml");
        std::fs::write(
            &config_path,
            r#"
bind_addr: "127.0.0.1:7443"
events:
  polling_interval_sec: 3
  storage: "memory"
  db_path: "/tmp/fabgate-test"
"#,
        )
        .unwrap();
        env::set_var("FABGATE_CONFIG", config_path.to_str().unwrap());

        let config = GatewayConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7443");
        assert_eq!(config.events.polling_interval_sec, 3);
        assert_eq!(config.events.storage, StorageBackend::Memory);
        assert_eq!(config.events.db_path, PathBuf::from("/tmp/fabgate-test"));

        clear_fabgate_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_file_not_found_fails() {
        clear_fabgate_env();
        let tmpdir = TempDir::new().unwrap();
        let nonexistent = tmpdir.path().join("nonexistent.yml");
        env::set_var("FABGATE_CONFIG", nonexistent.to_str().unwrap());
        assert!(GatewayConfig::from_env_or_yaml().is_err());
        clear_fabgate_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_invalid_yaml_fails() {
        clear_fabgate_env();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("bad.yml");
        std::fs::write(&config_path, "this is not: valid: yaml:").unwrap();
        env::set_var("FABGATE_CONFIG", config_path.to_str().unwrap());
        assert!(GatewayConfig::from_env_or_yaml().is_err());
        clear_fabgate_env();
    }
}

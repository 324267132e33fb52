//! Configuration handling for the extend service.
//!
//! Settings come from defaults, then the shared YAML config file, then
//! environment variables. Command-line flags are applied last by `main`.

use anyhow::Result;
use extend_messaging::PeerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Serializer used for object properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// Typed values written inline
    Native,
    /// CBOR blobs
    Cbor,
}

/// Extend service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendConfig {
    /// Service name announced by the acceptor
    pub service_name: String,
    /// Request timeout in milliseconds; 0 waits forever
    pub request_timeout_ms: u64,
    /// Channel close wait in milliseconds
    pub channel_close_timeout_ms: u64,
    /// Largest message sent or accepted
    pub max_message_size: usize,
    /// Execute pool size; 0 runs everything on the service thread
    pub execute_threads: usize,
    /// Object serializer
    pub serializer: SerializerKind,
    /// Requests issued by the demo run
    pub requests: usize,
    /// Client threads issuing requests
    pub concurrency: usize,
}

impl Default for ExtendConfig {
    fn default() -> Self {
        Self {
            service_name: "ExtendService".to_string(),
            request_timeout_ms: 30_000,
            channel_close_timeout_ms: 10_000,
            max_message_size: 16 * 1024 * 1024,
            execute_threads: 4,
            serializer: SerializerKind::Native,
            requests: 1000,
            concurrency: 4,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    extend: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl ExtendConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!("Failed to parse config file {:?}, using defaults", config_path.as_ref());
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final extend configuration: service={}, request_timeout_ms={}, max_message_size={}, execute_threads={}",
            config.service_name, config.request_timeout_ms, config.max_message_size, config.execute_threads
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(service) = root_config.services.and_then(|s| s.extend) {
            self.apply_service_config(service);
        }
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) {
        for arg in service_config.args.unwrap_or_default() {
            if let Some(n) = arg.strip_prefix("--requests=") {
                if let Ok(n) = n.parse() {
                    self.requests = n;
                }
            } else if let Some(n) = arg.strip_prefix("--concurrency=") {
                if let Ok(n) = n.parse() {
                    self.concurrency = n;
                }
            }
        }

        for (key, value) in service_config.config.unwrap_or_default() {
            match key.as_str() {
                "services.extend.service_name" => self.service_name = value,
                "services.extend.request_timeout_ms" => set_parsed(&mut self.request_timeout_ms, &key, &value),
                "services.extend.channel_close_timeout_ms" => {
                    set_parsed(&mut self.channel_close_timeout_ms, &key, &value)
                }
                "services.extend.max_message_size" => set_parsed(&mut self.max_message_size, &key, &value),
                "services.extend.execute_threads" => set_parsed(&mut self.execute_threads, &key, &value),
                "services.extend.serializer" => match value.to_lowercase().as_str() {
                    "native" => self.serializer = SerializerKind::Native,
                    "cbor" => self.serializer = SerializerKind::Cbor,
                    other => warn!("Unknown serializer {}, keeping {:?}", other, self.serializer),
                },
                _ => {
                    // Ignore unknown configuration keys
                }
            }
        }
    }

    /// Apply `EXTEND_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EXTEND_REQUEST_TIMEOUT_MS") {
            set_parsed(&mut self.request_timeout_ms, "EXTEND_REQUEST_TIMEOUT_MS", &value);
            info!("Request timeout overridden by environment: {}ms", self.request_timeout_ms);
        }
        if let Some(value) = lookup("EXTEND_MAX_MESSAGE_SIZE") {
            set_parsed(&mut self.max_message_size, "EXTEND_MAX_MESSAGE_SIZE", &value);
            info!("Max message size overridden by environment: {}", self.max_message_size);
        }
        if let Some(value) = lookup("EXTEND_EXECUTE_THREADS") {
            set_parsed(&mut self.execute_threads, "EXTEND_EXECUTE_THREADS", &value);
            info!("Execute threads overridden by environment: {}", self.execute_threads);
        }
        if let Some(value) = lookup("EXTEND_SERVICE_NAME") {
            self.service_name = value;
            info!("Service name overridden by environment: {}", self.service_name);
        }
    }

    /// Request timeout; `None` waits forever
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Connection manager settings for a peer named `service_name`
    pub fn peer_config(&self, service_name: &str) -> PeerConfig {
        PeerConfig::default()
            .with_service_name(service_name)
            .with_request_timeout(self.request_timeout())
            .with_channel_close_timeout(Duration::from_millis(self.channel_close_timeout_ms))
            .with_max_message_size(self.max_message_size)
            .with_execute_threads(self.execute_threads)
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("Ignoring invalid value {:?} for {}", value, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ExtendConfig::default();
        assert_eq!(config.service_name, "ExtendService");
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.serializer, SerializerKind::Native);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  extend:
    enabled: true
    executable: ./redb-extend
    args:
      - --requests=50
      - --concurrency=2
    config:
      services.extend.service_name: "Orders"
      services.extend.request_timeout_ms: "0"
      services.extend.max_message_size: "4096"
      services.extend.execute_threads: "not-a-number"
      services.extend.serializer: "cbor"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ExtendConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.service_name, "Orders");
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.execute_threads, 4);
        assert_eq!(config.serializer, SerializerKind::Cbor);
        assert_eq!(config.requests, 50);
        assert_eq!(config.concurrency, 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ExtendConfig::load_from_file("/nonexistent/extend.yaml").unwrap();
        assert_eq!(config.max_message_size, ExtendConfig::default().max_message_size);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [("EXTEND_EXECUTE_THREADS", "0"), ("EXTEND_SERVICE_NAME", "Env")]
            .into_iter()
            .collect();
        let mut config = ExtendConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.execute_threads, 0);
        assert_eq!(config.service_name, "Env");

        let peer = config.peer_config("Acceptor");
        assert_eq!(peer.service_name, "Acceptor");
        assert_eq!(peer.execute_threads, 0);
        assert_eq!(peer.max_incoming_message_size, config.max_message_size);
    }
}

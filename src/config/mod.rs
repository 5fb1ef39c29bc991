//! Configuration for the sidecar and driver processes.
//!
//! Sources, later overriding earlier:
//! 1. `dispatch.yaml` in the current directory (if it exists)
//! 2. The file named by `path` or by `DISPATCH_CONFIG`
//! 3. Environment variables prefixed `DISPATCH__` (e.g. `DISPATCH__LISTENER_PORT=9000`)

use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use dispatch_client::ClientOptions;

use crate::bus::{TransportConfig, TransportType};

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "dispatch";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DISPATCH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DISPATCH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DISPATCH_LOG";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Unsupported listener protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Transport '{0}' is not compiled in (enable the cargo feature)")]
    FeatureDisabled(&'static str),

    #[error("Failed to initialize transport: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// How the sidecar accepts requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    /// TCP on `listener_port`.
    Http,
    /// Unix domain socket at `listener_pipe`.
    Pipe,
    /// Recognized, not served.
    Grpc,
}

impl FromStr for ListenerProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "pipe" => Ok(Self::Pipe),
            "grpc" => Ok(Self::Grpc),
            other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Sidecar process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// `http`, `pipe` or `grpc`.
    pub listener_protocol: String,
    pub listener_port: u16,
    /// Socket path for the `pipe` protocol.
    pub listener_pipe: String,
    /// `memory` (alias `noop`), `rabbitmq` (alias `amqp`) or `kafka`.
    pub transport: String,
    pub rabbitmq_url: String,
    pub rabbitmq_exchange: String,
    pub kafka_brokers: String,
    /// Organization every ingested event is published under.
    pub tenant: String,
    /// OTLP collector endpoint; tracing export is off when unset.
    pub tracer_url: Option<String>,
    pub debug: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            listener_protocol: "http".to_string(),
            listener_port: 8080,
            listener_pipe: "/tmp/dispatch-sidecar.sock".to_string(),
            transport: "memory".to_string(),
            rabbitmq_url: transport.rabbitmq_url,
            rabbitmq_exchange: transport.rabbitmq_exchange,
            kafka_brokers: transport.kafka_brokers,
            tenant: "dispatch".to_string(),
            tracer_url: None,
            debug: false,
        }
    }
}

impl SidecarConfig {
    /// Load from file and environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        load(path)
    }

    pub fn protocol(&self) -> Result<ListenerProtocol, ConfigError> {
        self.listener_protocol.parse()
    }

    /// Broker settings; fails on an unknown transport name.
    pub fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
        let transport_type: TransportType = self.transport.parse()?;
        Ok(TransportConfig {
            transport_type,
            rabbitmq_url: self.rabbitmq_url.clone(),
            rabbitmq_exchange: self.rabbitmq_exchange.clone(),
            kafka_brokers: self.kafka_brokers.clone(),
            ..TransportConfig::default()
        })
    }
}

/// Driver process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Full sidecar URL; wins over `host`/`port`.
    pub sidecar_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Emit interval for timer-style drivers.
    pub interval_ms: Option<u64>,
    /// `source-id` stamped on emitted envelopes.
    pub source_id: Option<String>,
    pub tracer_url: Option<String>,
    pub debug: bool,
}

impl DriverConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        load(path)
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        match self.interval_ms {
            None => Ok(Self::DEFAULT_INTERVAL),
            Some(0) => Err(ConfigError::Invalid("interval_ms must be positive".to_string())),
            Some(ms) => Ok(Duration::from_millis(ms)),
        }
    }

    /// Client options: `DISPATCH_*` environment first, then this config.
    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::from_env();
        if let Some(url) = &self.sidecar_url {
            options = options.with_url(url);
        }
        if let Some(host) = &self.host {
            options = options.with_host(host);
        }
        if let Some(port) = self.port {
            options = options.with_port(port);
        }
        options
    }
}

fn load<T: DeserializeOwned>(path: Option<&str>) -> Result<T, ConfigError> {
    use ::config::{Config, Environment, File, FileFormat};

    let mut builder = Config::builder()
        .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

    if let Some(config_path) = path {
        builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
    } else if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
        builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_sidecar_config_default() {
        let config = SidecarConfig::default();
        assert_eq!(config.listener_port, 8080);
        assert_eq!(config.tenant, "dispatch");
        assert_eq!(config.protocol().unwrap(), ListenerProtocol::Http);
        assert_eq!(
            config.transport_config().unwrap().transport_type,
            TransportType::Memory
        );
    }

    #[test]
    fn test_listener_protocol_from_str() {
        assert_eq!("PIPE".parse::<ListenerProtocol>().unwrap(), ListenerProtocol::Pipe);
        assert_eq!("grpc".parse::<ListenerProtocol>().unwrap(), ListenerProtocol::Grpc);
        assert!(matches!(
            "smtp".parse::<ListenerProtocol>(),
            Err(ConfigError::UnsupportedProtocol(p)) if p == "smtp"
        ));
    }

    #[test]
    fn test_unknown_transport_is_error() {
        let config = SidecarConfig {
            transport: "nats".to_string(),
            ..SidecarConfig::default()
        };
        assert!(matches!(
            config.transport_config(),
            Err(ConfigError::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn test_driver_interval() {
        let mut config = DriverConfig::default();
        assert_eq!(config.interval().unwrap(), DriverConfig::DEFAULT_INTERVAL);
        config.interval_ms = Some(250);
        assert_eq!(config.interval().unwrap(), Duration::from_millis(250));
        config.interval_ms = Some(0);
        assert!(matches!(config.interval(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "listener_port: 9090\ntransport: rabbitmq\ntenant: acme\ndebug: true"
        )
        .unwrap();

        let config = SidecarConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.listener_port, 9090);
        assert_eq!(config.tenant, "acme");
        assert!(config.debug);
        assert_eq!(
            config.transport_config().unwrap().transport_type,
            TransportType::Rabbitmq
        );
        // Untouched keys keep their defaults
        assert_eq!(config.listener_protocol, "http");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DISPATCH__LISTENER_PORT", "7070");
        std::env::set_var("DISPATCH__TENANT", "from-env");
        let result = SidecarConfig::load(None);
        std::env::remove_var("DISPATCH__LISTENER_PORT");
        std::env::remove_var("DISPATCH__TENANT");

        let config = result.unwrap();
        assert_eq!(config.listener_port, 7070);
        assert_eq!(config.tenant, "from-env");
    }

    #[test]
    #[serial]
    fn test_driver_client_options() {
        std::env::remove_var(dispatch_client::client::URL_ENV_VAR);
        let config = DriverConfig {
            host: Some("sidecar".to_string()),
            port: Some(9000),
            ..DriverConfig::default()
        };
        let options = config.client_options();
        assert_eq!(options.target_url().unwrap().as_str(), "http://sidecar:9000/");

        let config = DriverConfig {
            sidecar_url: Some("http://10.0.0.5:8081/".to_string()),
            ..config
        };
        assert_eq!(
            config.client_options().target_url().unwrap().as_str(),
            "http://10.0.0.5:8081/"
        );
    }
}

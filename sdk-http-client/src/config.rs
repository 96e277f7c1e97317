//! # Client configuration
//!
//! Configuration consumed by [crate::factory::create_http_client]. It can be deserialized from YAML or loaded
//! through [ClientConfiguration::load], which also reads `SDK_HTTP_` prefixed environment variables.
pub mod proxy;

use crate::config::proxy::ProxyConfig;
use config::{Config, Environment, File, FileFormat};
use duration_str::deserialize_duration;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wrapper_with_default::WrapperWithDefault;

pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(50);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(50);
const DEFAULT_USE_REAPER: bool = true;

/// Prefix for environment variables overriding configuration values. Nested keys are separated by `__`, eg:
/// `SDK_HTTP_PROXY__HOST=proxy.example.com`.
pub const CONFIG_ENV_VAR_PREFIX: &str = "SDK_HTTP";

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("could not load the client configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid client configuration: {0}")]
    Invalid(String),
}

/// Maximum number of connections, applied both per route and in total.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_MAX_CONNECTIONS)]
pub struct MaxConnections(usize);

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_CONNECT_TIMEOUT)]
pub struct ConnectTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_SOCKET_TIMEOUT)]
pub struct SocketTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_USE_REAPER)]
pub struct UseReaper(bool);

/// Socket buffer size hints, `0` means unset.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SocketBufferSizeHints {
    pub send: usize,
    pub receive: usize,
}

impl SocketBufferSizeHints {
    pub fn new(send: usize, receive: usize) -> Self {
        Self { send, receive }
    }
}

/// Extra trust anchors added on top of the system root certificates.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// System path with the CA certificate in PEM format.
    pub ca_bundle_file: Option<PathBuf>,
    /// System path with the CA certificates in PEM format. All `.pem` files in the directory are read.
    pub ca_bundle_dir: Option<PathBuf>,
}

impl TlsConfig {
    pub fn ca_bundle_file(&self) -> Option<&Path> {
        self.ca_bundle_file.as_deref()
    }

    pub fn ca_bundle_dir(&self) -> Option<&Path> {
        self.ca_bundle_dir.as_deref()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfiguration {
    pub max_connections: MaxConnections,
    /// Maximum lifetime of a pooled connection. Connections live forever when unset.
    #[serde(deserialize_with = "deserialize_duration")]
    pub connection_ttl: Option<Duration>,
    /// Zero means no timeout.
    pub connect_timeout: ConnectTimeout,
    /// Zero means no timeout.
    pub socket_timeout: SocketTimeout,
    pub local_address: Option<IpAddr>,
    pub proxy: ProxyConfig,
    pub socket_buffer_size_hints: SocketBufferSizeHints,
    pub tcp_keep_alive: bool,
    pub gzip: bool,
    pub use_reaper: UseReaper,
    pub tls: TlsConfig,
}

impl ClientConfiguration {
    /// Loads the configuration from the optional YAML file, applying `SDK_HTTP_` environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        let configuration = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_VAR_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<ClientConfiguration>()?;

        configuration.validate()?;
        Ok(configuration)
    }

    /// Checks the values that would make the client construction fail.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_connections() == 0 {
            return Err(ConfigurationError::Invalid(
                "max_connections must be positive".to_string(),
            ));
        }
        self.proxy.resolve().map(|_| ())
    }

    pub fn max_connections(&self) -> usize {
        *self.max_connections.as_ref()
    }

    pub fn connect_timeout(&self) -> Duration {
        *self.connect_timeout.as_ref()
    }

    pub fn socket_timeout(&self) -> Duration {
        *self.socket_timeout.as_ref()
    }

    pub fn use_reaper(&self) -> bool {
        *self.use_reaper.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::proxy::ProxyConfig;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    impl ClientConfiguration {
        /// Configuration that does not depend on the proxy environment variables of the host running the tests.
        pub(crate) fn isolated() -> Self {
            ClientConfiguration {
                proxy: ProxyConfig {
                    ignore_system_proxy: true,
                    ..Default::default()
                },
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfiguration::default();

        assert_eq!(config.max_connections(), 50);
        assert_eq!(config.connection_ttl, None);
        assert_eq!(config.connect_timeout(), Duration::from_secs(50));
        assert_eq!(config.socket_timeout(), Duration::from_secs(50));
        assert_eq!(config.socket_buffer_size_hints, SocketBufferSizeHints::new(0, 0));
        assert!(config.use_reaper());
        assert!(!config.gzip);
        assert!(!config.tcp_keep_alive);
        assert!(config.local_address.is_none());
    }

    #[test]
    fn test_deserialize_full_configuration() {
        let content = r#"
            max_connections: 10
            connection_ttl: 30s
            connect_timeout: 5s
            socket_timeout: 1m
            local_address: 127.0.0.1
            proxy:
              host: proxy.example.com
              port: 8080
              username: user
              password: secret
              domain: corp
              workstation: ws01
              preemptive_basic_auth: true
            socket_buffer_size_hints:
              send: 4096
            tcp_keep_alive: true
            gzip: true
            use_reaper: false
            tls:
              ca_bundle_file: /etc/ssl/custom.pem
        "#;
        let config = serde_yaml::from_str::<ClientConfiguration>(content).unwrap();

        assert_eq!(config.max_connections(), 10);
        assert_eq!(config.connection_ttl, Some(Duration::from_secs(30)));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.socket_timeout(), Duration::from_secs(60));
        assert_eq!(config.local_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(config.proxy.host.as_deref(), Some("proxy.example.com"));
        assert_eq!(config.proxy.port, Some(8080));
        assert_eq!(config.proxy.domain.as_deref(), Some("corp"));
        assert!(config.proxy.preemptive_basic_auth);
        assert_eq!(config.socket_buffer_size_hints, SocketBufferSizeHints::new(4096, 0));
        assert!(config.tcp_keep_alive);
        assert!(config.gzip);
        assert!(!config.use_reaper());
        assert_eq!(
            config.tls.ca_bundle_file(),
            Some(Path::new("/etc/ssl/custom.pem"))
        );
    }

    #[rstest]
    #[case::missing("gzip: true")]
    #[case::null("connection_ttl: null")]
    fn test_connection_ttl_is_optional(#[case] content: &str) {
        let config = serde_yaml::from_str::<ClientConfiguration>(content).unwrap();
        assert_eq!(config.connection_ttl, None);
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let config = ClientConfiguration {
            max_connections: 0.into(),
            ..ClientConfiguration::isolated()
        };
        assert_matches!(config.validate(), Err(ConfigurationError::Invalid(s)) => {
            assert!(s.contains("max_connections"));
        });
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_connections: 7\ngzip: true\nproxy:\n  ignore_system_proxy: true"
        )
        .unwrap();

        // SAFETY: tests touching the environment are serialized
        unsafe { std::env::set_var("SDK_HTTP_MAX_CONNECTIONS", "12") };
        let config = ClientConfiguration::load(Some(file.path()));
        unsafe { std::env::remove_var("SDK_HTTP_MAX_CONNECTIONS") };

        let config = config.unwrap();
        assert_eq!(config.max_connections(), 12);
        assert!(config.gzip);
        assert!(config.proxy.ignore_system_proxy);
    }

    #[test]
    #[serial]
    fn test_load_missing_file() {
        let result = ClientConfiguration::load(Some(Path::new("non-existing-config.yaml")));
        assert_matches!(result, Err(ConfigurationError::Load(_)));
    }
}

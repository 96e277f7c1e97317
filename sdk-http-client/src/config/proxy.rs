use crate::auth::{AuthScope, NtCredentials};
use crate::config::ConfigurationError;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::borrow::Cow;
use std::env::{self, VarError};
use std::fmt;
use tracing::warn;
use url::Url;

pub(crate) const HTTP_PROXY_ENV_NAME: &str = "HTTP_PROXY";
pub(crate) const HTTPS_PROXY_ENV_NAME: &str = "HTTPS_PROXY";

/// Proxy for the SDK HTTP client.
/// The priority of the proxy configuration is as follows:
///
/// proxy `host` and `port` configuration options
/// HTTPS_PROXY system environment variable
/// HTTP_PROXY system environment variable
///
/// A configured host without a positive port means no proxy at all, the system proxy is not considered in
/// that case.
#[derive(Debug, Deserialize, PartialEq, Clone, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: Option<String>,
    pub port: Option<i32>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Windows domain for NTLM style credentials.
    pub domain: Option<String>,
    /// Windows workstation for NTLM style credentials.
    pub workstation: Option<String>,
    /// Send Basic proxy credentials with the first request instead of waiting for a challenge.
    pub preemptive_basic_auth: bool,
    /// When set to true, the HTTPS_PROXY and HTTP_PROXY environment variables are ignored
    pub ignore_system_proxy: bool,
}

/// Host and port of the proxy every request is routed through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyHost {
    host: String,
    port: u16,
}

impl ProxyHost {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://{self}")
    }

    pub fn auth_scope(&self) -> AuthScope {
        AuthScope::new(&self.host, self.port)
    }
}

impl fmt::Display for ProxyHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6 literals need brackets to be told apart from the port
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Value of the first non-empty system proxy environment variable, `HTTPS_PROXY` then `HTTP_PROXY`.
pub(crate) fn system_proxy_url<F>(env_var: F) -> Option<String>
where
    F: Fn(&'static str) -> Result<String, VarError>,
{
    [HTTPS_PROXY_ENV_NAME, HTTP_PROXY_ENV_NAME]
        .into_iter()
        .filter_map(|name| env_var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Parses a proxy url. Values without a scheme, eg: `proxy.local:3128`, are taken as `http`.
pub(crate) fn parse_proxy_url(value: &str) -> Result<Url, url::ParseError> {
    if value.contains("://") {
        Url::parse(value)
    } else {
        Url::parse(&format!("http://{value}"))
    }
}

/// Percent-decoded username and password from the user info of a proxy url.
pub(crate) fn url_credentials(url: &Url) -> Option<(String, String)> {
    let password = url.password()?;
    if url.username().is_empty() {
        return None;
    }
    let decode = |value: &str| {
        percent_decode_str(value)
            .decode_utf8()
            .map(Cow::into_owned)
            .ok()
    };
    Some((decode(url.username())?, decode(password)?))
}

/// Proxy settings ready to be applied to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProxy {
    pub host: ProxyHost,
    pub credentials: Option<NtCredentials>,
    pub preemptive_basic_auth: bool,
}

impl ProxyConfig {
    /// Returns the proxy to use according to configuration, this includes the value from environment variables if
    /// it applies.
    pub fn resolve(&self) -> Result<Option<ResolvedProxy>, ConfigurationError> {
        self.env_aware_resolve(env::var)
    }

    /// Returns the proxy to use, fetching the environment variables through the provided `env_var` function if
    /// required.
    pub(crate) fn env_aware_resolve<F>(
        &self,
        env_var: F,
    ) -> Result<Option<ResolvedProxy>, ConfigurationError>
    where
        F: Fn(&'static str) -> Result<String, VarError>,
    {
        if let Some(host) = self.host.as_deref().filter(|host| !host.is_empty()) {
            return self.resolve_configured(host);
        }
        if self.ignore_system_proxy {
            return Ok(None);
        }
        system_proxy_url(env_var)
            .map(|url| self.resolve_system(&url))
            .transpose()
    }

    fn resolve_configured(&self, host: &str) -> Result<Option<ResolvedProxy>, ConfigurationError> {
        let port = match self.port {
            Some(port) if port > 0 => u16::try_from(port).map_err(|_| {
                ConfigurationError::Invalid(format!("proxy port {port} is out of range"))
            })?,
            port => {
                warn!(
                    proxy_host = host,
                    proxy_port = ?port,
                    "proxy host configured without a positive port, no proxy will be used"
                );
                return Ok(None);
            }
        };

        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(self.nt_credentials(username, password)),
            _ => None,
        };

        Ok(Some(ResolvedProxy {
            host: ProxyHost::new(host, port),
            credentials,
            preemptive_basic_auth: self.preemptive_basic_auth,
        }))
    }

    fn resolve_system(&self, url: &str) -> Result<ResolvedProxy, ConfigurationError> {
        let parsed = parse_proxy_url(url).map_err(|err| {
            ConfigurationError::Invalid(format!("invalid system proxy url `{url}`: {err}"))
        })?;
        let host = parsed.host_str().filter(|host| !host.is_empty()).ok_or_else(|| {
            ConfigurationError::Invalid(format!("system proxy url `{url}` has no host"))
        })?;
        let port = parsed.port_or_known_default().ok_or_else(|| {
            ConfigurationError::Invalid(format!("system proxy url `{url}` has no port"))
        })?;

        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(self.nt_credentials(username, password)),
            _ => url_credentials(&parsed)
                .map(|(username, password)| self.nt_credentials(&username, &password)),
        };

        Ok(ResolvedProxy {
            host: ProxyHost::new(host, port),
            credentials,
            preemptive_basic_auth: self.preemptive_basic_auth,
        })
    }

    fn nt_credentials(&self, username: &str, password: &str) -> NtCredentials {
        NtCredentials::new(username, password)
            .with_domain(self.domain.clone())
            .with_workstation(self.workstation.clone())
    }
}

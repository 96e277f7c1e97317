//! # Platform aware client builder
//!
//! [SdkClientBuilder] turns a connection manager plus the client settings into a [SdkHttpClient] backed by a
//! blocking `reqwest` client.
use crate::auth::{
    AuthSchemeRegistry, CredentialsProvider, NoCredentials, NtCredentials, PlatformAuth,
};
use crate::client::{RequestConfig, SdkHttpClient};
use crate::config::ConfigurationError;
use crate::executor::SdkRequestExecutor;
use crate::interceptor::{Interceptors, RequestInterceptor, ResponseInterceptor};
use crate::pool::observed::ObservedConnectionManager;
use crate::pool::reaper::IdleConnectionReaper;
use crate::pool::{ConnectionManager, PoolingConnectionManager};
use crate::policy::{DefaultRedirectStrategy, DefaultRetryHandler, RedirectStrategy, RetryHandler};
use crate::socket::SocketOptions;
use crate::tls::TlsContextError;
use reqwest::Proxy;
use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Idle time before keep-alive probes are sent, matching the usual operating system default.
const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(7200);

#[derive(thiserror::Error, Debug)]
pub enum HttpClientBuildError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("could not build the tls context: {0}")]
    Tls(#[from] TlsContextError),
    #[error("`{0}` must run before `{1}`")]
    MissingStage(&'static str, &'static str),
    #[error("a connection manager is required")]
    MissingConnectionManager,
    #[error("could not build the transport client: {0}")]
    Transport(String),
}

pub struct SdkClientBuilder {
    connection_manager: Option<Arc<PoolingConnectionManager>>,
    request_config: RequestConfig,
    socket_options: SocketOptions,
    interceptors: Interceptors,
    redirect_strategy: Arc<dyn RedirectStrategy>,
    retry_handler: Arc<dyn RetryHandler>,
    auth_schemes: AuthSchemeRegistry,
    credentials_provider: Arc<dyn CredentialsProvider>,
    proxy_credentials: Option<NtCredentials>,
}

impl SdkClientBuilder {
    /// Builder with the library defaults: Basic authentication only, no credentials, default redirect and retry
    /// policies.
    pub fn custom() -> Self {
        Self {
            connection_manager: None,
            request_config: RequestConfig::default(),
            socket_options: SocketOptions::default(),
            interceptors: Interceptors::default(),
            redirect_strategy: Arc::new(DefaultRedirectStrategy),
            retry_handler: Arc::new(DefaultRetryHandler::default()),
            auth_schemes: AuthSchemeRegistry::default(),
            credentials_provider: Arc::new(NoCredentials),
            proxy_credentials: None,
        }
    }

    /// Builder whose authentication defaults depend on the capability of the platform, see [PlatformAuth::detect].
    pub fn with_platform_auth() -> Self {
        Self::for_platform(PlatformAuth::detect())
    }

    pub fn for_platform(platform: PlatformAuth) -> Self {
        debug!(?platform, "using platform authentication defaults");
        Self {
            auth_schemes: platform.auth_schemes(),
            credentials_provider: platform.default_credentials_provider(),
            ..Self::custom()
        }
    }

    pub fn connection_manager(self, connection_manager: Arc<PoolingConnectionManager>) -> Self {
        Self {
            connection_manager: Some(connection_manager),
            ..self
        }
    }

    pub fn default_request_config(self, request_config: RequestConfig) -> Self {
        Self {
            request_config,
            ..self
        }
    }

    pub fn socket_options(self, socket_options: SocketOptions) -> Self {
        Self {
            socket_options,
            ..self
        }
    }

    pub fn add_request_interceptor_first(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptors.add_request_first(interceptor);
        self
    }

    pub fn add_request_interceptor_last(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptors.add_request_last(interceptor);
        self
    }

    pub fn add_response_interceptor_last(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
        self.interceptors.add_response_last(interceptor);
        self
    }

    pub fn redirect_strategy(self, redirect_strategy: Arc<dyn RedirectStrategy>) -> Self {
        Self {
            redirect_strategy,
            ..self
        }
    }

    pub fn retry_handler(self, retry_handler: Arc<dyn RetryHandler>) -> Self {
        Self {
            retry_handler,
            ..self
        }
    }

    pub fn credentials_provider(self, credentials_provider: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            credentials_provider,
            ..self
        }
    }

    /// Proxy credentials handed to the transport for the tunnel (`CONNECT`) requests of https routes. Plain http
    /// requests get them through the authentication cache instead.
    pub fn proxy_credentials(self, credentials: NtCredentials) -> Self {
        Self {
            proxy_credentials: Some(credentials),
            ..self
        }
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    /// Builds the client. The connection manager is deregistered from the reaper and shut down if the transport
    /// cannot be built.
    pub fn build(self) -> Result<SdkHttpClient, HttpClientBuildError> {
        let manager = self
            .connection_manager
            .clone()
            .ok_or(HttpClientBuildError::MissingConnectionManager)?;

        let client = match self.transport_client(&manager) {
            Ok(client) => client,
            Err(err) => {
                IdleConnectionReaper::global().deregister(&manager);
                manager.shutdown();
                return Err(err);
            }
        };

        let manager: Arc<dyn ConnectionManager> = manager;
        Ok(SdkHttpClient {
            executor: Arc::new(SdkRequestExecutor::new(client)),
            connection_manager: ObservedConnectionManager::new(manager),
            request_config: self.request_config,
            interceptors: self.interceptors,
            redirect_strategy: self.redirect_strategy,
            retry_handler: self.retry_handler,
            auth_schemes: self.auth_schemes,
            credentials_provider: self.credentials_provider,
        })
    }

    fn transport_client(
        &self,
        manager: &Arc<PoolingConnectionManager>,
    ) -> Result<Client, HttpClientBuildError> {
        let limits = manager.limits();
        let request_config = &self.request_config;
        let socket_options = &self.socket_options;
        let reaper = IdleConnectionReaper::global();
        let reaper_max_idle = reaper.is_registered(manager).then(|| reaper.max_idle());

        // Only the proxy resolved from configuration is used, never the one detected by the transport.
        let mut builder = Client::builder()
            .no_proxy()
            .redirect(Policy::none())
            .tcp_nodelay(socket_options.tcp_no_delay())
            .tcp_keepalive(socket_options.keep_alive().then_some(TCP_KEEPALIVE_IDLE))
            .pool_max_idle_per_host(limits.max_per_route)
            .pool_idle_timeout(transport_idle_timeout(limits.time_to_live, reaper_max_idle))
            .local_address(request_config.local_address);

        if !request_config.connect_timeout.is_zero() {
            builder = builder.connect_timeout(request_config.connect_timeout);
        }
        if !request_config.socket_timeout.is_zero() {
            builder = builder.timeout(request_config.socket_timeout);
        }
        if let Some(tls_context) = manager.socket_factories().tls_context() {
            builder = builder.use_preconfigured_tls(tls_context.client_config().clone());
        }
        if let Some(proxy_host) = &request_config.proxy {
            let invalid_proxy = |err: reqwest::Error| {
                HttpClientBuildError::Transport(format!("invalid proxy {proxy_host}: {err}"))
            };
            builder = match &self.proxy_credentials {
                // The transport cannot answer a challenge to a tunnel request, credentials go with every one
                Some(credentials) => builder
                    .proxy(Proxy::http(proxy_host.url()).map_err(invalid_proxy)?)
                    .proxy(
                        Proxy::https(proxy_host.url())
                            .map_err(invalid_proxy)?
                            .basic_auth(&credentials.principal(), credentials.password()),
                    ),
                None => builder.proxy(Proxy::all(proxy_host.url()).map_err(invalid_proxy)?),
            };
        }
        if let Some(size) = socket_options.send_buffer_size() {
            warn!(
                send = size,
                receive = ?socket_options.receive_buffer_size(),
                "socket buffer sizes are not supported by the transport, the hints are ignored"
            );
        }

        builder
            .build()
            .map_err(|err| HttpClientBuildError::Transport(err.to_string()))
    }
}

/// Time idle transport sockets are kept: the connection TTL, capped by the reaper idle time for reaped managers.
/// `None` keeps them until the server closes them.
fn transport_idle_timeout(ttl: Option<Duration>, reaper_max_idle: Option<Duration>) -> Option<Duration> {
    ttl.into_iter().chain(reaper_max_idle).min()
}

impl Default for SdkClientBuilder {
    fn default() -> Self {
        Self::custom()
    }
}

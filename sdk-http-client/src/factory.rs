//! # HTTP client factory
//!
//! [create_http_client] builds a [SdkHttpClient] out of a [ClientConfiguration] applying the [STAGES] in order.
//! Each stage takes the partially built [ClientBlueprint] and returns it with its part configured.
use crate::auth::BasicCredentialsProvider;
use crate::builder::{HttpClientBuildError, SdkClientBuilder};
use crate::client::{RequestConfig, SdkHttpClient};
use crate::config::ClientConfiguration;
use crate::interceptor::gzip::{AcceptGzipEncoding, GzipResponseDecompression};
use crate::interceptor::proxy_auth::PreemptiveProxyAuth;
use crate::pool::{PoolingConnectionManager, create_pooling_connection_manager};
use crate::policy::{NeverFollowRedirects, NoRetry};
use crate::socket::{HTTP_SCHEME, HTTPS_SCHEME, SocketFactory, SocketFactoryRegistry, SocketOptions};
use crate::tls::{TlsContext, build_tls_context};
use std::sync::Arc;
use tracing::debug;

pub type Stage = fn(ClientBlueprint, &ClientConfiguration) -> Result<ClientBlueprint, HttpClientBuildError>;

/// Build stages in the order they are applied.
pub const STAGES: [(&str, Stage); 9] = [
    ("tls_context", tls_context),
    ("socket_factories", socket_factories),
    ("connection_manager", connection_manager),
    ("request_config", request_config),
    ("proxy", proxy),
    ("socket_options", socket_options),
    ("gzip", gzip),
    ("redirects", redirects),
    ("retries", retries),
];

/// Client under construction.
pub struct ClientBlueprint {
    pub tls_context: Option<TlsContext>,
    pub socket_factories: Option<SocketFactoryRegistry>,
    pub connection_manager: Option<Arc<PoolingConnectionManager>>,
    pub request_config: RequestConfig,
    pub socket_options: SocketOptions,
    pub builder: SdkClientBuilder,
}

impl ClientBlueprint {
    pub fn new(builder: SdkClientBuilder) -> Self {
        Self {
            tls_context: None,
            socket_factories: None,
            connection_manager: None,
            request_config: RequestConfig::default(),
            socket_options: SocketOptions::default(),
            builder,
        }
    }
}

impl std::fmt::Debug for ClientBlueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBlueprint").finish_non_exhaustive()
    }
}

impl Default for ClientBlueprint {
    fn default() -> Self {
        Self::new(SdkClientBuilder::with_platform_auth())
    }
}

/// Creates a client configured according to `config`.
pub fn create_http_client(config: &ClientConfiguration) -> Result<SdkHttpClient, HttpClientBuildError> {
    // Fails before any stage registers the connection manager in the reaper.
    config.validate()?;

    let mut blueprint = ClientBlueprint::default();
    for (name, stage) in STAGES {
        blueprint = stage(blueprint, config)?;
        debug!(stage = name, "client build stage applied");
    }
    assemble(blueprint)
}

pub fn tls_context(
    mut blueprint: ClientBlueprint,
    config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    blueprint.tls_context = Some(build_tls_context(&config.tls)?);
    Ok(blueprint)
}

pub fn socket_factories(
    mut blueprint: ClientBlueprint,
    _config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    let tls_context = blueprint
        .tls_context
        .clone()
        .ok_or(HttpClientBuildError::MissingStage("tls_context", "socket_factories"))?;
    blueprint.socket_factories = Some(
        SocketFactoryRegistry::default()
            .register(HTTPS_SCHEME, SocketFactory::Tls(tls_context))
            .register(HTTP_SCHEME, SocketFactory::Plain),
    );
    Ok(blueprint)
}

pub fn connection_manager(
    mut blueprint: ClientBlueprint,
    config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    let socket_factories = blueprint
        .socket_factories
        .take()
        .ok_or(HttpClientBuildError::MissingStage("socket_factories", "connection_manager"))?;
    blueprint.connection_manager = Some(create_pooling_connection_manager(config, socket_factories));
    Ok(blueprint)
}

pub fn request_config(
    mut blueprint: ClientBlueprint,
    config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    blueprint.request_config = RequestConfig {
        connect_timeout: config.connect_timeout(),
        socket_timeout: config.socket_timeout(),
        local_address: config.local_address,
        ..blueprint.request_config
    };
    Ok(blueprint)
}

pub fn proxy(
    mut blueprint: ClientBlueprint,
    config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    let Some(resolved) = config.proxy.resolve()? else {
        return Ok(blueprint);
    };
    debug!(proxy = %resolved.host, "using proxy");
    blueprint.request_config.proxy = Some(resolved.host.clone());

    if let Some(credentials) = resolved.credentials {
        let mut provider = BasicCredentialsProvider::default();
        provider.set_credentials(resolved.host.auth_scope(), credentials.clone());
        let mut builder = blueprint
            .builder
            .credentials_provider(Arc::new(provider))
            .proxy_credentials(credentials);

        if resolved.preemptive_basic_auth {
            builder = builder
                .add_request_interceptor_first(Arc::new(PreemptiveProxyAuth::new(resolved.host)));
        }
        blueprint.builder = builder;
    }
    Ok(blueprint)
}

pub fn socket_options(
    mut blueprint: ClientBlueprint,
    config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    blueprint.socket_options = SocketOptions::default()
        .with_tcp_no_delay(true)
        .with_keep_alive(config.tcp_keep_alive)
        .with_buffer_size_hints(config.socket_buffer_size_hints);
    Ok(blueprint)
}

pub fn gzip(
    mut blueprint: ClientBlueprint,
    config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    if config.gzip {
        blueprint.builder = blueprint
            .builder
            .add_request_interceptor_last(Arc::new(AcceptGzipEncoding))
            .add_response_interceptor_last(Arc::new(GzipResponseDecompression));
    }
    Ok(blueprint)
}

pub fn redirects(
    mut blueprint: ClientBlueprint,
    _config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    blueprint.builder = blueprint
        .builder
        .redirect_strategy(Arc::new(NeverFollowRedirects));
    Ok(blueprint)
}

pub fn retries(
    mut blueprint: ClientBlueprint,
    _config: &ClientConfiguration,
) -> Result<ClientBlueprint, HttpClientBuildError> {
    blueprint.builder = blueprint.builder.retry_handler(Arc::new(NoRetry));
    Ok(blueprint)
}

/// Hands the configured parts to the builder and builds the client.
pub fn assemble(blueprint: ClientBlueprint) -> Result<SdkHttpClient, HttpClientBuildError> {
    let connection_manager = blueprint
        .connection_manager
        .ok_or(HttpClientBuildError::MissingStage("connection_manager", "assemble"))?;
    blueprint
        .builder
        .connection_manager(connection_manager)
        .default_request_config(blueprint.request_config)
        .socket_options(blueprint.socket_options)
        .build()
}

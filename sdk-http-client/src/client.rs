//! # SDK HTTP client
//!
//! [SdkHttpClient] is the assembled client returned by [crate::factory::create_http_client]. It owns its
//! connection manager: dropping the client deregisters the manager from the idle connection reaper and shuts it
//! down.
use crate::auth::{AuthScheme, AuthSchemeRegistry, AuthScope, ChallengeState, CredentialsProvider};
use crate::config::proxy::ProxyHost;
use crate::executor::{RequestExecutor, TransportError};
use crate::interceptor::{CachedAuth, ExecutionContext, InterceptorError, Interceptors};
use crate::pool::observed::ObservedConnectionManager;
use crate::pool::reaper::IdleConnectionReaper;
use crate::pool::{ConnectionManager, PoolError, Route};
use crate::policy::{RedirectStrategy, RetryHandler};
use crate::socket::HTTP_SCHEME;
use http::header::HOST;
use http::{Method, Request, Response, StatusCode, Uri};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum number of redirects followed for a single request.
pub const MAX_REDIRECTS: usize = 50;

#[derive(thiserror::Error, Debug)]
pub enum HttpClientError {
    #[error("connection error: {0}")]
    Connection(#[from] PoolError),
    #[error("interceptor error: {0}")]
    Interceptor(#[from] InterceptorError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("maximum number of redirects ({0}) exceeded")]
    TooManyRedirects(usize),
    #[error("could not build credentials for `{scope}`: {reason}")]
    Credentials { scope: AuthScope, reason: String },
}

pub trait HttpClient {
    fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpClientError> {
        self.execute_with_context(request, &mut ExecutionContext::default())
    }

    fn execute_with_context(
        &self,
        request: Request<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<Response<Vec<u8>>, HttpClientError>;
}

/// Per request defaults of a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestConfig {
    /// Zero means no timeout.
    pub connect_timeout: Duration,
    /// Zero means no timeout.
    pub socket_timeout: Duration,
    pub local_address: Option<IpAddr>,
    pub proxy: Option<ProxyHost>,
}

impl RequestConfig {
    /// Time to wait for a pooled connection, bounded by the connect timeout.
    fn lease_timeout(&self) -> Duration {
        if self.connect_timeout.is_zero() {
            Duration::MAX
        } else {
            self.connect_timeout
        }
    }
}

pub struct SdkHttpClient {
    pub(crate) executor: Arc<dyn RequestExecutor>,
    pub(crate) connection_manager: ObservedConnectionManager,
    pub(crate) request_config: RequestConfig,
    pub(crate) interceptors: Interceptors,
    pub(crate) redirect_strategy: Arc<dyn RedirectStrategy>,
    pub(crate) retry_handler: Arc<dyn RetryHandler>,
    pub(crate) auth_schemes: AuthSchemeRegistry,
    pub(crate) credentials_provider: Arc<dyn CredentialsProvider>,
}

impl std::fmt::Debug for SdkHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkHttpClient").finish_non_exhaustive()
    }
}

enum Outcome {
    Done(Response<Vec<u8>>),
    Redirect { target: Uri, status: StatusCode },
}

impl SdkHttpClient {
    pub fn connection_manager(&self) -> &ObservedConnectionManager {
        &self.connection_manager
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.request_config
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    pub fn redirect_strategy(&self) -> &dyn RedirectStrategy {
        self.redirect_strategy.as_ref()
    }

    pub fn retry_handler(&self) -> &dyn RetryHandler {
        self.retry_handler.as_ref()
    }

    pub fn auth_schemes(&self) -> &AuthSchemeRegistry {
        &self.auth_schemes
    }

    /// Sends the request, answering authentication challenges, and turns the final response into an [Outcome]
    /// while the connection is leased.
    fn exchange(
        &self,
        request: &Request<Vec<u8>>,
        route: &Route,
        context: &mut ExecutionContext,
    ) -> Result<Outcome, HttpClientError> {
        let mut answered = Vec::new();
        let mut response = loop {
            let mut outgoing = clone_request(request);
            self.apply_cached_auth(&mut outgoing, route, context)?;
            let response = self.send_with_retries(outgoing)?;
            if !self.answer_challenge(route, &response, context, &mut answered) {
                break response;
            }
        };

        if self.redirect_strategy.is_redirected(request, &response) {
            if let Some(target) = self.redirect_strategy.redirect_target(request, &response) {
                return Ok(Outcome::Redirect {
                    target,
                    status: response.status(),
                });
            }
        }

        self.interceptors.process_response(&mut response, context)?;
        Ok(Outcome::Done(response))
    }

    fn send_with_retries(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpClientError> {
        let mut attempt = 0;
        loop {
            match self.executor.send(clone_request(&request)) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    let Some(wait) = self.retry_handler.retry_request(&request, attempt) else {
                        return Err(err.into());
                    };
                    debug!(attempt, uri = %request.uri(), "retrying request after error: {err}");
                    thread::sleep(wait);
                }
            }
        }
    }

    /// Adds the Basic authorization headers of the cached scopes the request goes to.
    /// Proxy credentials are only added to plain http requests, https requests carry them in the tunnel request.
    fn apply_cached_auth(
        &self,
        request: &mut Request<Vec<u8>>,
        route: &Route,
        context: &ExecutionContext,
    ) -> Result<(), HttpClientError> {
        let target_scope = AuthScope::new(route.host(), route.port());
        let proxy_scope = self
            .request_config
            .proxy
            .as_ref()
            .filter(|_| route.scheme() == HTTP_SCHEME)
            .map(ProxyHost::auth_scope);

        for (scope, cached) in context.auth_cache().iter() {
            if cached.scheme != AuthScheme::Basic {
                continue;
            }
            let applies = match cached.state {
                ChallengeState::Target => scope == &target_scope,
                ChallengeState::Proxy => proxy_scope.as_ref() == Some(scope),
            };
            let header = cached.state.authorization_header();
            if !applies || request.headers().contains_key(&header) {
                continue;
            }
            let Some(credentials) = self.credentials_provider.credentials(scope) else {
                continue;
            };
            let value = credentials
                .basic_authorization()
                .map_err(|err| HttpClientError::Credentials {
                    scope: scope.clone(),
                    reason: err.to_string(),
                })?;
            request.headers_mut().insert(header, value);
        }
        Ok(())
    }

    /// Caches Basic authentication for the challenged scope when the response is a challenge the client can
    /// answer. Each kind of challenge is answered once per exchange.
    fn answer_challenge(
        &self,
        route: &Route,
        response: &Response<Vec<u8>>,
        context: &mut ExecutionContext,
        answered: &mut Vec<ChallengeState>,
    ) -> bool {
        let Some(state) = ChallengeState::from_status(response.status()) else {
            return false;
        };
        if answered.contains(&state) {
            return false;
        }
        let Some(scheme) = response
            .headers()
            .get_all(state.challenge_header())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(AuthScheme::from_challenge)
            .find(|scheme| self.auth_schemes.contains(*scheme))
        else {
            return false;
        };
        if scheme != AuthScheme::Basic {
            debug!(%scheme, "authentication challenge is left to the caller");
            return false;
        }

        let scope = match state {
            ChallengeState::Target => AuthScope::new(route.host(), route.port()),
            ChallengeState::Proxy => match &self.request_config.proxy {
                Some(proxy) if route.scheme() == HTTP_SCHEME => proxy.auth_scope(),
                _ => return false,
            },
        };
        if self.credentials_provider.credentials(&scope).is_none() {
            debug!(%scope, "no credentials to answer the authentication challenge");
            return false;
        }

        debug!(%scope, %scheme, "answering authentication challenge");
        context.auth_cache_mut().put(scope, CachedAuth { scheme, state });
        answered.push(state);
        true
    }
}

impl HttpClient for SdkHttpClient {
    fn execute_with_context(
        &self,
        mut request: Request<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<Response<Vec<u8>>, HttpClientError> {
        let mut redirects = 0;
        loop {
            let route = Route::from_uri(request.uri())?;
            self.interceptors.process_request(&mut request, context)?;

            let lease = self
                .connection_manager
                .lease(&route, self.request_config.lease_timeout())?;
            let outcome = self.exchange(&request, &route, context);
            self.connection_manager.release(lease, outcome.is_ok());

            match outcome? {
                Outcome::Done(response) => return Ok(response),
                Outcome::Redirect { target, status } => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(HttpClientError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    debug!(from = %request.uri(), to = %target, "following redirect");
                    request = redirect_request(&request, target, status);
                }
            }
        }
    }
}

impl Drop for SdkHttpClient {
    fn drop(&mut self) {
        IdleConnectionReaper::global().deregister(self.connection_manager.inner());
        self.connection_manager.shutdown();
    }
}

fn clone_request(request: &Request<Vec<u8>>) -> Request<Vec<u8>> {
    let mut cloned = Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    cloned
}

/// A `303` turns the request into a body-less `GET`, other redirects keep method and body.
fn redirect_request(request: &Request<Vec<u8>>, target: Uri, status: StatusCode) -> Request<Vec<u8>> {
    let mut redirected = clone_request(request);
    *redirected.uri_mut() = target;
    redirected.headers_mut().remove(HOST);
    if status == StatusCode::SEE_OTHER && request.method() != Method::HEAD {
        *redirected.method_mut() = Method::GET;
        redirected.body_mut().clear();
    }
    if redirected.uri().host() != request.uri().host() {
        warn!(to = %redirected.uri(), "redirected to a different host");
    }
    redirected
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{BasicCredentialsProvider, NoCredentials, NtCredentials};
    use crate::executor::MockRequestExecutor;
    use crate::pool::tests::plain_registry;
    use crate::pool::{PoolLimits, PoolingConnectionManager};
    use crate::policy::{DefaultRedirectStrategy, DefaultRetryHandler, NeverFollowRedirects, NoRetry};
    use assert_matches::assert_matches;
    use http::header::{AUTHORIZATION, LOCATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
    use mockall::Sequence;

    fn client(executor: MockRequestExecutor) -> SdkHttpClient {
        let manager: Arc<dyn ConnectionManager> = Arc::new(PoolingConnectionManager::new(
            plain_registry(),
            PoolLimits::uniform(2, None),
        ));
        SdkHttpClient {
            executor: Arc::new(executor),
            connection_manager: ObservedConnectionManager::new(manager),
            request_config: RequestConfig {
                connect_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            interceptors: Interceptors::default(),
            redirect_strategy: Arc::new(NeverFollowRedirects),
            retry_handler: Arc::new(NoRetry),
            auth_schemes: AuthSchemeRegistry::default(),
            credentials_provider: Arc::new(NoCredentials),
        }
    }

    fn get(uri: &str) -> Request<Vec<u8>> {
        Request::builder().uri(uri).body(Vec::new()).unwrap()
    }

    fn response(status: StatusCode) -> Response<Vec<u8>> {
        Response::builder().status(status).body(Vec::new()).unwrap()
    }

    fn credentials_for(scope: AuthScope) -> Arc<dyn CredentialsProvider> {
        let mut provider = BasicCredentialsProvider::default();
        provider.set_credentials(scope, NtCredentials::new("user", "secret"));
        Arc::new(provider)
    }

    #[test]
    fn test_connection_is_released_after_execution() {
        let mut executor = MockRequestExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(response(StatusCode::OK)));
        executor
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::Other("boom".to_string())));
        let client = client(executor);

        client.execute(get("http://localhost/")).unwrap();
        assert_eq!(client.connection_manager().stats().available, 1);

        assert_matches!(
            client.execute(get("http://localhost/")),
            Err(HttpClientError::Transport(_))
        );
        let stats = client.connection_manager().stats();
        assert_eq!((stats.leased, stats.available), (0, 0));
    }

    #[test]
    fn test_unsupported_route() {
        let client = client(MockRequestExecutor::new());
        assert_matches!(
            client.execute(get("https://localhost/")),
            Err(HttpClientError::Connection(PoolError::UnsupportedScheme(_)))
        );
        assert_matches!(
            client.execute(get("/relative")),
            Err(HttpClientError::Connection(PoolError::InvalidRoute { .. }))
        );
    }

    #[test]
    fn test_no_retry_sends_once() {
        let mut executor = MockRequestExecutor::new();
        executor
            .expect_send()
            .once()
            .returning(|_| Err(TransportError::Connect("refused".to_string())));
        let client = client(executor);

        assert_matches!(
            client.execute(get("http://localhost/")),
            Err(HttpClientError::Transport(TransportError::Connect(_)))
        );
    }

    #[test]
    fn test_retry_handler_is_consulted() {
        let mut executor = MockRequestExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::Connect("refused".to_string())));
        executor
            .expect_send()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(response(StatusCode::OK)));
        let mut client = client(executor);
        client.retry_handler = Arc::new(DefaultRetryHandler::default());

        assert_eq!(
            client.execute(get("http://localhost/")).unwrap().status(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_redirect_is_returned_when_not_followed() {
        let mut executor = MockRequestExecutor::new();
        executor.expect_send().once().returning(|_| {
            Ok(Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, "/other")
                .body(Vec::new())
                .unwrap())
        });
        let client = client(executor);

        let response = client.execute(get("http://localhost/")).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[test]
    fn test_redirects_followed_by_strategy() {
        let mut executor = MockRequestExecutor::new();
        executor
            .expect_send()
            .withf(|request| request.uri().path() == "/old")
            .once()
            .returning(|_| {
                Ok(Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(LOCATION, "/new")
                    .body(Vec::new())
                    .unwrap())
            });
        executor
            .expect_send()
            .withf(|request| request.uri() == "http://localhost/new")
            .once()
            .returning(|_| Ok(response(StatusCode::OK)));
        let mut client = client(executor);
        client.redirect_strategy = Arc::new(DefaultRedirectStrategy);

        let response = client.execute(get("http://localhost/old")).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_redirect_loop_is_bounded() {
        let mut executor = MockRequestExecutor::new();
        executor
            .expect_send()
            .times(MAX_REDIRECTS + 1)
            .returning(|_| {
                Ok(Response::builder()
                    .status(StatusCode::FOUND)
                    .header(LOCATION, "/loop")
                    .body(Vec::new())
                    .unwrap())
            });
        let mut client = client(executor);
        client.redirect_strategy = Arc::new(DefaultRedirectStrategy);

        assert_matches!(
            client.execute(get("http://localhost/loop")),
            Err(HttpClientError::TooManyRedirects(MAX_REDIRECTS))
        );
    }

    #[test]
    fn test_basic_target_challenge_is_answered_once() {
        let mut executor = MockRequestExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_send()
            .withf(|request| !request.headers().contains_key(AUTHORIZATION))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header(WWW_AUTHENTICATE, "Basic realm=\"api\"")
                    .body(Vec::new())
                    .unwrap())
            });
        executor
            .expect_send()
            .withf(|request| {
                request
                    .headers()
                    .get(AUTHORIZATION)
                    .is_some_and(|value| value == "Basic dXNlcjpzZWNyZXQ=")
            })
            .once()
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header(WWW_AUTHENTICATE, "Basic realm=\"api\"")
                    .body(Vec::new())
                    .unwrap())
            });
        let mut client = client(executor);
        client.credentials_provider = credentials_for(AuthScope::new("localhost", 80));

        let mut context = ExecutionContext::default();
        let response = client
            .execute_with_context(get("http://localhost/"), &mut context)
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(context
            .auth_cache()
            .get(&AuthScope::new("localhost", 80))
            .is_some());
    }

    #[test]
    fn test_challenge_without_credentials_is_returned() {
        let mut executor = MockRequestExecutor::new();
        executor.expect_send().once().returning(|_| {
            Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(WWW_AUTHENTICATE, "Basic realm=\"api\"")
                .body(Vec::new())
                .unwrap())
        });
        let client = client(executor);

        let response = client.execute(get("http://localhost/")).unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_unregistered_scheme_is_not_answered() {
        let mut executor = MockRequestExecutor::new();
        executor.expect_send().once().returning(|_| {
            Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(WWW_AUTHENTICATE, "NTLM")
                .body(Vec::new())
                .unwrap())
        });
        let mut client = client(executor);
        client.credentials_provider = credentials_for(AuthScope::new("localhost", 80));

        let response = client.execute(get("http://localhost/")).unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_proxy_challenge_is_answered_for_plain_http() {
        let mut executor = MockRequestExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_send()
            .withf(|request| !request.headers().contains_key(PROXY_AUTHORIZATION))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Response::builder()
                    .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
                    .header(PROXY_AUTHENTICATE, "Basic realm=\"proxy\"")
                    .body(Vec::new())
                    .unwrap())
            });
        executor
            .expect_send()
            .withf(|request| request.headers().contains_key(PROXY_AUTHORIZATION))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(response(StatusCode::OK)));
        let proxy = ProxyHost::new("proxy.example.com", 8080);
        let mut client = client(executor);
        client.credentials_provider = credentials_for(proxy.auth_scope());
        client.request_config.proxy = Some(proxy);

        let response = client.execute(get("http://localhost/")).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_drop_shuts_down_the_connection_manager() {
        let pooling = Arc::new(PoolingConnectionManager::new(
            plain_registry(),
            PoolLimits::uniform(1, None),
        ));
        IdleConnectionReaper::global().register(pooling.clone());
        let manager: Arc<dyn ConnectionManager> = pooling.clone();
        let mut client = client(MockRequestExecutor::new());
        client.connection_manager = ObservedConnectionManager::new(manager);

        drop(client);

        assert!(!IdleConnectionReaper::global().deregister(&pooling));
        assert_eq!(
            pooling.lease(&Route::new(HTTP_SCHEME, "localhost", 80), Duration::ZERO),
            Err(PoolError::ShutDown)
        );
    }
}

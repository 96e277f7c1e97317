//! # Request and response interceptors
//!
//! Interceptors run in chain order on every request before it is sent and on every response before it is
//! returned to the caller. They share the [ExecutionContext] of the request being executed.
pub mod gzip;
pub mod proxy_auth;

use crate::auth::{AuthScheme, AuthScope, ChallengeState};
use http::{Request, Response};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum InterceptorError {
    #[error("could not decompress the response body: {0}")]
    Decompression(#[from] std::io::Error),
}

/// Authentication scheme selected for a scope, either because a challenge was answered or because it was
/// seeded before sending the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedAuth {
    pub scheme: AuthScheme,
    pub state: ChallengeState,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuthCache {
    entries: HashMap<AuthScope, CachedAuth>,
}

impl AuthCache {
    pub fn put(&mut self, scope: AuthScope, auth: CachedAuth) {
        self.entries.insert(scope, auth);
    }

    pub fn get(&self, scope: &AuthScope) -> Option<&CachedAuth> {
        self.entries.get(scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AuthScope, &CachedAuth)> {
        self.entries.iter()
    }
}

/// State of a single request execution. It can be reused across requests to keep the authentication cache.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    auth_cache: AuthCache,
}

impl ExecutionContext {
    pub fn auth_cache(&self) -> &AuthCache {
        &self.auth_cache
    }

    pub fn auth_cache_mut(&mut self) -> &mut AuthCache {
        &mut self.auth_cache
    }
}

pub trait RequestInterceptor: Send + Sync {
    fn process(
        &self,
        request: &mut Request<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError>;
}

pub trait ResponseInterceptor: Send + Sync {
    fn process(
        &self,
        response: &mut Response<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError>;
}

/// Ordered request and response interceptor chains.
#[derive(Clone, Default)]
pub struct Interceptors {
    request: Vec<Arc<dyn RequestInterceptor>>,
    response: Vec<Arc<dyn ResponseInterceptor>>,
}

impl Interceptors {
    pub fn add_request_first(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request.insert(0, interceptor);
    }

    pub fn add_request_last(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request.push(interceptor);
    }

    pub fn add_response_last(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.response.push(interceptor);
    }

    pub fn request_count(&self) -> usize {
        self.request.len()
    }

    pub fn response_count(&self) -> usize {
        self.response.len()
    }

    pub fn process_request(
        &self,
        request: &mut Request<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError> {
        self.request
            .iter()
            .try_for_each(|interceptor| interceptor.process(request, context))
    }

    pub fn process_response(
        &self,
        response: &mut Response<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError> {
        self.response
            .iter()
            .try_for_each(|interceptor| interceptor.process(response, context))
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .finish()
    }
}

use crate::auth::{AuthScheme, ChallengeState};
use crate::config::proxy::ProxyHost;
use crate::interceptor::{CachedAuth, ExecutionContext, InterceptorError, RequestInterceptor};
use http::Request;

/// Seeds the authentication cache with the Basic scheme for the proxy so credentials are sent with the first
/// request instead of after a `407` challenge.
#[derive(Debug, Clone)]
pub struct PreemptiveProxyAuth {
    proxy: ProxyHost,
}

impl PreemptiveProxyAuth {
    pub fn new(proxy: ProxyHost) -> Self {
        Self { proxy }
    }
}

impl RequestInterceptor for PreemptiveProxyAuth {
    fn process(
        &self,
        _request: &mut Request<Vec<u8>>,
        context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError> {
        context.auth_cache_mut().put(
            self.proxy.auth_scope(),
            CachedAuth {
                scheme: AuthScheme::Basic,
                state: ChallengeState::Proxy,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthScope;

    #[test]
    fn test_basic_is_seeded_for_the_proxy() {
        let interceptor = PreemptiveProxyAuth::new(ProxyHost::new("proxy.example.com", 8080));
        let mut context = ExecutionContext::default();
        interceptor
            .process(&mut Request::new(Vec::new()), &mut context)
            .unwrap();

        let cached = context
            .auth_cache()
            .get(&AuthScope::new("proxy.example.com", 8080))
            .unwrap();
        assert_eq!(cached.scheme, AuthScheme::Basic);
        assert_eq!(cached.state, ChallengeState::Proxy);
        assert!(context
            .auth_cache()
            .get(&AuthScope::new("proxy.example.com", 80))
            .is_none());
    }
}

//! Redirect and retry policies consulted by [crate::client::SdkHttpClient] while executing a request.
use http::header::LOCATION;
use http::{Method, Request, Response, StatusCode, Uri};
use std::fmt::Debug;
use std::time::Duration;

/// Decides whether a response is a redirect the client should follow and where to.
pub trait RedirectStrategy: Send + Sync + Debug {
    fn is_redirected(&self, request: &Request<Vec<u8>>, response: &Response<Vec<u8>>) -> bool;
    fn redirect_target(
        &self,
        request: &Request<Vec<u8>>,
        response: &Response<Vec<u8>>,
    ) -> Option<Uri>;
}

/// Redirect responses are returned to the caller as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverFollowRedirects;

impl RedirectStrategy for NeverFollowRedirects {
    fn is_redirected(&self, _request: &Request<Vec<u8>>, _response: &Response<Vec<u8>>) -> bool {
        false
    }

    fn redirect_target(
        &self,
        _request: &Request<Vec<u8>>,
        _response: &Response<Vec<u8>>,
    ) -> Option<Uri> {
        None
    }
}

/// Follows `301`, `302`, `303`, `307` and `308` responses of `GET` and `HEAD` requests to their `Location`.
/// Relative locations are resolved against the request uri.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRedirectStrategy;

impl RedirectStrategy for DefaultRedirectStrategy {
    fn is_redirected(&self, request: &Request<Vec<u8>>, response: &Response<Vec<u8>>) -> bool {
        let redirect_status = matches!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        redirect_status
            && matches!(*request.method(), Method::GET | Method::HEAD)
            && response.headers().contains_key(LOCATION)
    }

    fn redirect_target(
        &self,
        request: &Request<Vec<u8>>,
        response: &Response<Vec<u8>>,
    ) -> Option<Uri> {
        if !self.is_redirected(request, response) {
            return None;
        }
        let location = response.headers().get(LOCATION)?.to_str().ok()?;
        let base = url::Url::parse(&request.uri().to_string()).ok()?;
        base.join(location).ok()?.as_str().parse().ok()
    }
}

/// Decides whether a request failing with a transport error is sent again.
pub trait RetryHandler: Send + Sync + Debug {
    /// `attempt` starts at 1 for the first failed execution.
    fn retry_request(&self, request: &Request<Vec<u8>>, attempt: u32) -> Option<Duration>;
}

/// Failed requests are never retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl RetryHandler for NoRetry {
    fn retry_request(&self, _request: &Request<Vec<u8>>, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Retries idempotent requests up to `max_retries` times, waiting `interval` between attempts.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRetryHandler {
    max_retries: u32,
    interval: Duration,
}

impl DefaultRetryHandler {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }
}

impl Default for DefaultRetryHandler {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

impl RetryHandler for DefaultRetryHandler {
    fn retry_request(&self, request: &Request<Vec<u8>>, attempt: u32) -> Option<Duration> {
        (request.method().is_idempotent() && attempt <= self.max_retries).then_some(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(method: Method, uri: &str) -> Request<Vec<u8>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Vec::new())
            .unwrap()
    }

    fn redirect(status: StatusCode, location: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(LOCATION, location)
            .body(Vec::new())
            .unwrap()
    }

    #[rstest]
    #[case(StatusCode::MOVED_PERMANENTLY)]
    #[case(StatusCode::FOUND)]
    #[case(StatusCode::SEE_OTHER)]
    #[case(StatusCode::TEMPORARY_REDIRECT)]
    #[case(StatusCode::PERMANENT_REDIRECT)]
    fn test_never_follow_redirects(#[case] status: StatusCode) {
        let request = request(Method::GET, "http://localhost/a");
        let response = redirect(status, "/b");

        assert!(!NeverFollowRedirects.is_redirected(&request, &response));
        assert!(NeverFollowRedirects.redirect_target(&request, &response).is_none());
        // The default strategy would have followed it
        assert!(DefaultRedirectStrategy.is_redirected(&request, &response));
    }

    #[rstest]
    #[case("/b", "http://localhost:8080/b")]
    #[case("c?x=1", "http://localhost:8080/dir/c?x=1")]
    #[case("https://other.host/d", "https://other.host/d")]
    fn test_default_redirect_target(#[case] location: &str, #[case] expected: &str) {
        let request = request(Method::GET, "http://localhost:8080/dir/a");
        let response = redirect(StatusCode::FOUND, location);
        assert_eq!(
            DefaultRedirectStrategy
                .redirect_target(&request, &response)
                .unwrap()
                .to_string(),
            expected
        );
    }

    #[test]
    fn test_default_redirect_ignores_non_redirects_and_posts() {
        let post = request(Method::POST, "http://localhost/a");
        assert!(!DefaultRedirectStrategy.is_redirected(&post, &redirect(StatusCode::FOUND, "/b")));

        let get = request(Method::GET, "http://localhost/a");
        let ok = Response::new(Vec::new());
        assert!(!DefaultRedirectStrategy.is_redirected(&get, &ok));
    }

    #[rstest]
    #[case(Method::GET)]
    #[case(Method::PUT)]
    #[case(Method::POST)]
    fn test_no_retry(#[case] method: Method) {
        let request = request(method, "http://localhost/");
        for attempt in 1..5 {
            assert_eq!(NoRetry.retry_request(&request, attempt), None);
        }
    }

    #[test]
    fn test_default_retry_handler() {
        let handler = DefaultRetryHandler::new(2, Duration::from_millis(5));
        let get = request(Method::GET, "http://localhost/");
        assert_eq!(handler.retry_request(&get, 1), Some(Duration::from_millis(5)));
        assert_eq!(handler.retry_request(&get, 2), Some(Duration::from_millis(5)));
        assert_eq!(handler.retry_request(&get, 3), None);

        let post = request(Method::POST, "http://localhost/");
        assert_eq!(handler.retry_request(&post, 1), None);
    }
}

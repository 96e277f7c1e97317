//! # Request execution hook
//!
//! Sends a single request through the `reqwest` transport and turns the transport response into an
//! [http::Response<Vec<u8>>].
use reqwest::blocking::{Client, Response};
use tracing::trace;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("could not build the request: {0}")]
    BuildingRequest(String),
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("could not read response body: {0}")]
    ReadingResponse(String),
    #[error("could not build response: {0}")]
    BuildingResponse(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_builder() || err.is_request() {
            Self::BuildingRequest(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Sends one request and returns the response as received, without following redirects or retrying.
#[cfg_attr(test, mockall::automock)]
pub trait RequestExecutor: Send + Sync {
    fn send(&self, request: http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, TransportError>;
}

/// [RequestExecutor] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct SdkRequestExecutor {
    client: Client,
}

impl SdkRequestExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl RequestExecutor for SdkRequestExecutor {
    fn send(&self, request: http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, TransportError> {
        trace!(method = %request.method(), uri = %request.uri(), "sending request");
        let request = reqwest::blocking::Request::try_from(request)
            .map_err(|err| TransportError::BuildingRequest(err.to_string()))?;
        let response = self.client.execute(request)?;
        try_build_response(response)
    }
}

/// Helper to build a [http::Response<Vec<u8>>] from a reqwest's blocking response.
/// It includes status, version, headers and body.
pub fn try_build_response(res: Response) -> Result<http::Response<Vec<u8>>, TransportError> {
    let status = res.status();
    let version = res.version();
    let headers = res.headers().clone();
    let body: Vec<u8> = res
        .bytes()
        .map_err(|err| TransportError::ReadingResponse(err.to_string()))?
        .into();
    let mut response = http::Response::builder()
        .status(status)
        .version(version)
        .body(body)
        .map_err(|err| TransportError::BuildingResponse(err.to_string()))?;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use http::StatusCode;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use std::time::Duration;

    fn executor() -> SdkRequestExecutor {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        SdkRequestExecutor::new(client)
    }

    #[test]
    fn test_send_includes_headers_and_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/data")
                .header("x-request", "value")
                .body("payload");
            then.status(201).header("x-response", "other").body("created");
        });

        let request = http::Request::builder()
            .method("POST")
            .uri(server.url("/data"))
            .header("x-request", "value")
            .body(b"payload".to_vec())
            .unwrap();
        let response = executor().send(request).unwrap();

        mock.assert();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-response"], "other");
        assert_eq!(response.body(), b"created");
    }

    #[test]
    fn test_connection_refused() {
        // Nothing listens on the port once the listener is dropped
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let url = format!("http://127.0.0.1:{port}/");
        let request = http::Request::builder().uri(url).body(Vec::new()).unwrap();
        assert_matches!(executor().send(request), Err(TransportError::Connect(_)));
    }

    #[test]
    fn test_redirect_is_returned_as_is() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/old");
            then.status(302).header("location", "/new");
        });
        let client = Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let request = http::Request::builder()
            .uri(server.url("/old"))
            .body(Vec::new())
            .unwrap();
        let response = SdkRequestExecutor::new(client).send(request).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/new");
    }
}

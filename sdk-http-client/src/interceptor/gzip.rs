use crate::interceptor::{
    ExecutionContext, InterceptorError, RequestInterceptor, ResponseInterceptor,
};
use flate2::read::GzDecoder;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderValue, Request, Response};
use std::io::Read;
use tracing::trace;

const GZIP: &str = "gzip";

/// Adds `Accept-Encoding: gzip` to requests that do not set an accepted encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptGzipEncoding;

impl RequestInterceptor for AcceptGzipEncoding {
    fn process(
        &self,
        request: &mut Request<Vec<u8>>,
        _context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError> {
        if !request.headers().contains_key(ACCEPT_ENCODING) {
            request
                .headers_mut()
                .insert(ACCEPT_ENCODING, HeaderValue::from_static(GZIP));
        }
        Ok(())
    }
}

/// Replaces gzip encoded response bodies with their decompressed content.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipResponseDecompression;

impl ResponseInterceptor for GzipResponseDecompression {
    fn process(
        &self,
        response: &mut Response<Vec<u8>>,
        _context: &mut ExecutionContext,
    ) -> Result<(), InterceptorError> {
        if response.body().is_empty() || !is_gzip_encoded(response) {
            return Ok(());
        }

        let mut decompressed = Vec::new();
        GzDecoder::new(response.body().as_slice()).read_to_end(&mut decompressed)?;
        trace!(
            compressed = response.body().len(),
            decompressed = decompressed.len(),
            "gzip response body decompressed"
        );

        *response.body_mut() = decompressed;
        let headers = response.headers_mut();
        headers.remove(CONTENT_ENCODING);
        headers.remove(CONTENT_LENGTH);
        Ok(())
    }
}

/// True when any element of any `Content-Encoding` header is `gzip`, ignoring case.
fn is_gzip_encoded(response: &Response<Vec<u8>>) -> bool {
    response
        .headers()
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|element| element.trim().eq_ignore_ascii_case(GZIP))
}

//! Direct HTTP forwarding for URL-routed compilers.
//!
//! The backend's response is passed through byte-for-byte; only hop-by-hop
//! headers are scrubbed on the way in and out.

use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::RouterError;

/// Headers that only apply to a single transport hop.
static HOP_BY_HOP: once_cell::sync::Lazy<[HeaderName; 7]> = once_cell::sync::Lazy::new(|| {
    [
        HeaderName::from_static("connection"),
        HeaderName::from_static("upgrade"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        HeaderName::from_static("transfer-encoding"),
    ]
});

static VIA: once_cell::sync::Lazy<HeaderName> =
    once_cell::sync::Lazy::new(|| HeaderName::from_static("via"));

/// Total deadline for one forwarded request.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

/// A backend response ready for re-emission.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Client for URL-routed backends.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpForwarder {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FORWARD_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// POST the raw request body to the backend. Any HTTP status is a
    /// successful forward; only transport trouble is an error.
    pub async fn forward(
        &self,
        compiler_id: &str,
        target_url: &str,
        body: Bytes,
        is_cmake: bool,
        headers: &HeaderMap,
    ) -> Result<ForwardedResponse, RouterError> {
        // The target carries its full path already; nothing is appended.
        let url = target_url.trim_end_matches('/');
        debug!(
            compiler_id = %compiler_id,
            url = %url,
            is_cmake,
            bytes = body.len(),
            "forwarding to backend"
        );

        let response = self
            .client
            .post(url)
            .headers(prepare_request_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(compiler_id = %compiler_id, url = %url, error = %e, "forward failed");
                if e.is_timeout() {
                    RouterError::Forward(format!("backend timed out after 60 seconds: {e}"))
                } else {
                    RouterError::Forward(e.to_string())
                }
            })?;

        let status = response.status();
        let headers = filter_response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| RouterError::Forward(format!("reading backend response failed: {e}")))?;

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Flatten multi-valued request headers with `", "` joins and drop the
/// hop-by-hop set, plus the framing headers the client rewrites itself.
fn prepare_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut prepared = HeaderMap::new();
    for name in headers.keys() {
        if HOP_BY_HOP.contains(name)
            || *name == axum::http::header::HOST
            || *name == axum::http::header::CONTENT_LENGTH
        {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            prepared.insert(name.clone(), value);
        }
    }
    prepared
}

/// Drop hop-by-hop headers plus `via` from a backend response.
fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name) || *name == *VIA {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_headers_drop_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("upgrade", HeaderValue::from_static("h2c"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailers", HeaderValue::from_static("Expires"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let prepared = prepare_request_headers(&headers);
        for name in HOP_BY_HOP.iter() {
            assert!(!prepared.contains_key(name), "{name} should be stripped");
        }
        assert_eq!(prepared["content-type"], "application/json");
    }

    #[test]
    fn request_headers_flatten_multi_values() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let prepared = prepare_request_headers(&headers);
        assert_eq!(prepared["accept"], "text/plain, application/json");
    }

    #[test]
    fn response_headers_drop_hop_by_hop_and_via() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("via", HeaderValue::from_static("1.1 proxy"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-backend", HeaderValue::from_static("42"));

        let filtered = filter_response_headers(&headers);
        assert!(!filtered.contains_key("transfer-encoding"));
        assert!(!filtered.contains_key("via"));
        assert_eq!(filtered["content-type"], "application/json");
        assert_eq!(filtered["x-backend"], "42");
    }
}

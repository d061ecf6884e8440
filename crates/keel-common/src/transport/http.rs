//! HTTP response helpers shared by the API server and the balancer.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::{Request, Response, StatusCode};

use crate::protocol::error::reason_phrase;
use crate::protocol::{ErrorBody, ResponseEnvelope};

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// Headers sent with every response.
const SECURITY_HEADERS: [(&str, &str); 4] = [
    ("X-XSS-Protection", "1; mode=block"),
    ("X-Content-Type-Options", "nosniff"),
    ("Referrer-Policy", "no-referrer"),
    ("Strict-Transport-Security", "max-age=31536000; includeSubdomains; preload"),
];

pub struct HttpTransport;

impl HttpTransport {
    /// Response carrying `body` with the given status and content type.
    pub fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HyperResponse {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        for (name, value) in SECURITY_HEADERS {
            headers.insert(name, HeaderValue::from_static(value));
        }
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        response
    }

    /// `200 OK` with a response envelope. Business errors travel inside the
    /// envelope, not in the status line.
    pub fn envelope(envelope: &ResponseEnvelope) -> HyperResponse {
        Self::envelope_with_status(StatusCode::OK, envelope)
    }

    pub fn envelope_with_status(status: StatusCode, envelope: &ResponseEnvelope) -> HyperResponse {
        let body = serde_json::to_vec(&envelope.to_value()).unwrap_or_default();
        Self::response(status, "application/json; charset=utf-8", body)
    }

    /// Transport-level failure: non-2xx status with an error envelope for call 0.
    pub fn transport_error(status: StatusCode) -> HyperResponse {
        let envelope = ResponseEnvelope::error(0, ErrorBody::from_code(status.as_u16()));
        Self::envelope_with_status(status, &envelope)
    }

    /// Plain status page for non-API paths.
    pub fn status(status: StatusCode) -> HyperResponse {
        Self::response(
            status,
            "text/plain; charset=utf-8",
            reason_phrase(status.as_u16()).to_string(),
        )
    }

    pub fn redirect(location: &str) -> HyperResponse {
        let mut response = Self::status(StatusCode::FOUND);
        if let Ok(value) = HeaderValue::from_str(location) {
            response.headers_mut().insert(LOCATION, value);
        }
        response
    }

    /// Appends a `Set-Cookie` header.
    pub fn with_cookie(mut response: HyperResponse, cookie: &str) -> HyperResponse {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
        response
    }
}

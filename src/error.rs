//! Error taxonomy and error responses for the request pipeline
//!
//! Request-scoped failures are always turned into an HTTP response here;
//! nothing from the pipeline is allowed to propagate past the connection
//! handler. The "not found" and "unreachable" pages are rendered once and
//! cached until the next config sync invalidates them.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;

/// Error codes for dispatch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// No site matched the hostname/IP
    NoSiteMatched,
    /// Request already carries our own forwarding marker
    LoopDetected,
    /// Backend could not be reached after retries
    BackendUnreachable,
    /// Worker pool failed to produce an address
    WorkerStartFailed,
    /// Basic-auth credentials missing or wrong
    Unauthorized,
    /// Plaintext upgrade refused because an HTTPS listener exists
    InsecureUpgradeRefused,
    /// Static file outside the site root or not found
    FileNotFound,
    /// Internal dispatcher error
    InternalError,
}

impl GateErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GateErrorCode::NoSiteMatched => StatusCode::NOT_FOUND,
            GateErrorCode::LoopDetected => StatusCode::LOOP_DETECTED,
            GateErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            GateErrorCode::WorkerStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GateErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            GateErrorCode::InsecureUpgradeRefused => StatusCode::FORBIDDEN,
            GateErrorCode::FileNotFound => StatusCode::NOT_FOUND,
            GateErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code as sent in the X-Gate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GateErrorCode::NoSiteMatched => "NO_SITE_MATCHED",
            GateErrorCode::LoopDetected => "LOOP_DETECTED",
            GateErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            GateErrorCode::WorkerStartFailed => "WORKER_START_FAILED",
            GateErrorCode::Unauthorized => "UNAUTHORIZED",
            GateErrorCode::InsecureUpgradeRefused => "INSECURE_UPGRADE_REFUSED",
            GateErrorCode::FileNotFound => "FILE_NOT_FOUND",
            GateErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Response body type used throughout the request pipeline
pub type GateBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> GateBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GateErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GateErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Gate-Error header
pub fn json_error_response(code: GateErrorCode, message: impl Into<String>) -> Response<GateBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gate-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Lazily rendered, cached HTML pages for routing misses and dead backends.
///
/// Rendering happens at most once per invalidation; `invalidate` is called
/// by the dispatcher whenever a config sync runs.
#[derive(Debug, Default)]
pub struct ErrorPages {
    not_found: Mutex<Option<Bytes>>,
    unreachable: Mutex<Option<Bytes>>,
}

impl ErrorPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_found(&self) -> Response<GateBody> {
        let body = {
            let mut cached = self.not_found.lock();
            cached
                .get_or_insert_with(|| Bytes::from(render_page("Site not found", NOT_FOUND_TEXT)))
                .clone()
        };
        html_response(StatusCode::NOT_FOUND, GateErrorCode::NoSiteMatched, body)
    }

    pub fn unreachable(&self) -> Response<GateBody> {
        let body = {
            let mut cached = self.unreachable.lock();
            cached
                .get_or_insert_with(|| {
                    Bytes::from(render_page("Site unreachable", UNREACHABLE_TEXT))
                })
                .clone()
        };
        html_response(
            StatusCode::BAD_GATEWAY,
            GateErrorCode::BackendUnreachable,
            body,
        )
    }

    /// Drop cached renderings; the next request re-renders.
    pub fn invalidate(&self) {
        *self.not_found.lock() = None;
        *self.unreachable.lock() = None;
    }
}

fn html_response(status: StatusCode, code: GateErrorCode, body: Bytes) -> Response<GateBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Gate-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

const NOT_FOUND_TEXT: &str = "No site is configured for this hostname.";
const UNREACHABLE_TEXT: &str = "The site backend did not respond. Please try again shortly.";

fn render_page(title: &str, text: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{text}</p></body></html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GateErrorCode::LoopDetected.status_code(),
            StatusCode::LOOP_DETECTED
        );
        assert_eq!(
            GateErrorCode::NoSiteMatched.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GateErrorCode::BackendUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GateErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GateErrorCode::NoSiteMatched, "no site for ghost.test");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NO_SITE_MATCHED\""));
        assert!(json.contains("\"message\":\"no site for ghost.test\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(GateErrorCode::LoopDetected, "forwarding loop");
        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
        assert_eq!(
            response.headers().get("X-Gate-Error").unwrap(),
            "LOOP_DETECTED"
        );
    }

    #[test]
    fn test_error_pages_cached_and_invalidated() {
        let pages = ErrorPages::new();
        let first = pages.not_found();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        assert!(pages.not_found.lock().is_some());

        pages.invalidate();
        assert!(pages.not_found.lock().is_none());
        assert!(pages.unreachable.lock().is_none());
    }
}

//! JSON error responses for the proxy and setup surfaces

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes reported in the body and the X-Proxy-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No operator password is configured
    SetupPasswordMissing,
    /// Missing or malformed operator credentials
    AuthRequired,
    /// Operator credentials did not match
    InvalidPassword,
    /// Gateway could not be started or did not become ready
    GatewayUnavailable,
    /// An onboarding run is already in progress
    OnboardingInProgress,
    /// Malformed request payload
    BadRequest,
    /// Unknown route
    NotFound,
    /// Request timed out waiting for the gateway
    RequestTimeout,
    /// Failed to connect to the gateway
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::SetupPasswordMissing => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::InvalidPassword => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::OnboardingInProgress => StatusCode::CONFLICT,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::SetupPasswordMissing => "SETUP_PASSWORD_MISSING",
            ProxyErrorCode::AuthRequired => "AUTH_REQUIRED",
            ProxyErrorCode::InvalidPassword => "INVALID_PASSWORD",
            ProxyErrorCode::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ProxyErrorCode::OnboardingInProgress => "ONBOARDING_IN_PROGRESS",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

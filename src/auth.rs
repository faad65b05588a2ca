//! Operator password gate shared by the proxy and the setup API

use crate::error::{json_error_response, ProxyErrorCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::Response;
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CHALLENGE: &str = "Basic realm=\"Openclaw Setup\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("SETUP_PASSWORD is not set. Set it in the deployment environment and redeploy.")]
    NotConfigured,
    #[error("Auth required")]
    MissingCredentials,
    #[error("Invalid password")]
    InvalidPassword,
}

impl AuthRejection {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            AuthRejection::NotConfigured => ProxyErrorCode::SetupPasswordMissing,
            AuthRejection::MissingCredentials => ProxyErrorCode::AuthRequired,
            AuthRejection::InvalidPassword => ProxyErrorCode::InvalidPassword,
        }
    }

    /// 500 for a missing password, otherwise 401 with a Basic challenge
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = json_error_response(self.code(), self.to_string());
        if self != AuthRejection::NotConfigured {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
        }
        response
    }
}

/// Checks HTTP Basic credentials against the operator password.
///
/// The username is ignored. Passwords are compared as HMAC tags under a
/// per-process random key so the comparison time does not depend on the
/// length of a matching prefix.
pub struct AuthGate {
    key: [u8; 32],
    expected: Option<Vec<u8>>,
}

impl AuthGate {
    pub fn new(password: Option<&str>) -> Self {
        let mut rng = rand::thread_rng();
        let key: [u8; 32] = rng.gen();
        let expected = password
            .filter(|p| !p.is_empty())
            .map(|p| tag(&key, p.as_bytes()));
        Self { key, expected }
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        let expected = self.expected.as_ref().ok_or(AuthRejection::NotConfigured)?;
        let password = basic_password(headers).ok_or(AuthRejection::MissingCredentials)?;

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(password.as_bytes());
        mac.verify_slice(expected)
            .map_err(|_| AuthRejection::InvalidPassword)
    }
}

fn tag(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(value);
    mac.finalize().into_bytes().to_vec()
}

/// Password part of a `Basic` Authorization header
fn basic_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    fn basic(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode(format!("{}:{}", user, password));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_correct_password_any_user() {
        let gate = AuthGate::new(Some("hunter2"));
        assert!(gate.check(&basic("admin", "hunter2")).is_ok());
        assert!(gate.check(&basic("", "hunter2")).is_ok());
    }

    #[test]
    fn test_password_may_contain_colons() {
        let gate = AuthGate::new(Some("a:b:c"));
        assert!(gate.check(&basic("user", "a:b:c")).is_ok());
    }

    #[test]
    fn test_wrong_password() {
        let gate = AuthGate::new(Some("hunter2"));
        assert_eq!(
            gate.check(&basic("admin", "hunter3")),
            Err(AuthRejection::InvalidPassword)
        );
        assert_eq!(
            gate.check(&basic("admin", "hunter")),
            Err(AuthRejection::InvalidPassword)
        );
    }

    #[test]
    fn test_missing_or_malformed_credentials() {
        let gate = AuthGate::new(Some("hunter2"));
        assert_eq!(
            gate.check(&HeaderMap::new()),
            Err(AuthRejection::MissingCredentials)
        );

        let mut bearer = HeaderMap::new();
        bearer.insert(AUTHORIZATION, HeaderValue::from_static("Bearer hunter2"));
        assert_eq!(gate.check(&bearer), Err(AuthRejection::MissingCredentials));

        let mut garbage = HeaderMap::new();
        garbage.insert(AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert_eq!(gate.check(&garbage), Err(AuthRejection::MissingCredentials));
    }

    #[test]
    fn test_unconfigured_gate_rejects_everything() {
        let gate = AuthGate::new(None);
        assert!(!gate.is_configured());
        assert_eq!(
            gate.check(&basic("admin", "anything")),
            Err(AuthRejection::NotConfigured)
        );
        assert!(!AuthGate::new(Some("")).is_configured());
    }

    #[test]
    fn test_rejection_responses() {
        let response = AuthRejection::MissingCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"Openclaw Setup\""
        );

        let response = AuthRejection::InvalidPassword.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));

        let response = AuthRejection::NotConfigured.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(WWW_AUTHENTICATE));
    }
}

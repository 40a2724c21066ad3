//! HTTP Basic authentication policy.

use axum::http::{header, HeaderMap};
use base64::Engine;
use serde::Deserialize;
use std::fmt;

/// A username/password pair.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Extracts Basic credentials from an `Authorization` header.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self::new(username, password))
    }

    /// Renders the value of an `Authorization` header for these credentials.
    pub fn to_header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    fn matches(&self, other: &Credentials) -> bool {
        // Evaluate both fields so the outcome does not reveal which one failed.
        let user = constant_time_eq(self.username.as_bytes(), other.username.as_bytes());
        let pass = constant_time_eq(self.password.as_bytes(), other.password.as_bytes());
        user & pass
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Who may talk to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Every request is accepted.
    #[default]
    Disabled,
    /// Requests must carry exactly these Basic credentials.
    Basic(Credentials),
}

impl AuthPolicy {
    /// Checks a request's headers against the policy.
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        match self {
            Self::Disabled => true,
            Self::Basic(expected) => Credentials::from_headers(headers)
                .map(|given| expected.matches(&given))
                .unwrap_or(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Basic(_))
    }
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

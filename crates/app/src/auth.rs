//! Optional HTTP Basic auth in front of the pod lookup route.

use std::fmt;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use metrics::counter;
use tracing::debug;

use crate::error::HttpError;

/// Configured credentials. The gate is active only when both parts are non-empty.
#[derive(Clone, Default)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    pub fn disabled() -> Self { Self::default() }

    pub fn is_enabled(&self) -> bool { !self.username.is_empty() && !self.password.is_empty() }

    /// Check an `Authorization` header value. Always true when the gate is off.
    pub fn verify(&self, header: Option<&str>) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let Some((user, pass)) = header.and_then(parse_basic) else {
            return false;
        };
        // both comparisons run regardless of the first outcome
        let user_ok = constant_time_eq(user.as_bytes(), self.username.as_bytes());
        let pass_ok = constant_time_eq(pass.as_bytes(), self.password.as_bytes());
        user_ok & pass_ok
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth").field("username", &self.username).field("enabled", &self.is_enabled()).finish()
    }
}

/// Decode `Basic <base64(user:pass)>`. The password may itself contain `:`.
fn parse_basic(value: &str) -> Option<(String, String)> {
    let scheme = value.get(..6)?;
    if !scheme.eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = STANDARD.decode(value[6..].trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Route layer: reject with 401 before the handler (and its method check) runs.
pub async fn require_basic_auth(State(auth): State<BasicAuth>, req: Request, next: Next) -> Response {
    let header = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if auth.verify(header) {
        return next.run(req).await;
    }
    debug!(path = %req.uri().path(), "basic auth rejected");
    counter!("http_auth_rejections_total", 1u64);
    HttpError::Unauthorized.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user: &str, pass: &str) -> String { format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))) }

    #[test]
    fn disabled_gate_admits_everything() {
        assert!(BasicAuth::disabled().verify(None));
        assert!(BasicAuth::new("admin", "").verify(None));
        assert!(BasicAuth::new("", "secret").verify(Some("garbage")));
    }

    #[test]
    fn accepts_matching_credentials() {
        let auth = BasicAuth::new("admin", "secret");
        assert!(auth.verify(Some(&basic("admin", "secret"))));
        assert!(auth.verify(Some(&format!("basic {}", STANDARD.encode("admin:secret")))));
    }

    #[test]
    fn rejects_missing_or_wrong() {
        let auth = BasicAuth::new("admin", "secret");
        assert!(!auth.verify(None));
        assert!(!auth.verify(Some(&basic("admin", "wrong"))));
        assert!(!auth.verify(Some(&basic("root", "secret"))));
        assert!(!auth.verify(Some("Bearer abc")));
        assert!(!auth.verify(Some("Basic !!!not-base64")));
        assert!(!auth.verify(Some(&format!("Basic {}", STANDARD.encode("no-colon")))));
    }

    #[test]
    fn password_may_contain_colon() {
        let auth = BasicAuth::new("admin", "a:b:c");
        assert!(auth.verify(Some(&basic("admin", "a:b:c"))));
    }

    #[test]
    fn debug_hides_password() {
        let dbg = format!("{:?}", BasicAuth::new("admin", "secret"));
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn ct_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}

//! Caller identity resolution.

use axum::http::{header, HeaderMap};

use crate::error::{GraphError, GraphResult};

/// Header naming the calling user.
pub const USER_HEADER: &str = "x-user-id";

pub trait IdentityResolver: Send + Sync {
    /// Resolve the caller id for a request, or reject it as `UNAUTHENTICATED`.
    fn resolve(&self, headers: &HeaderMap) -> GraphResult<String>;
}

/// Trusts the `x-user-id` header, optionally gated by a shared bearer key.
#[derive(Debug, Clone, Default)]
pub struct HeaderIdentity {
    api_key: Option<String>,
}

impl HeaderIdentity {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> GraphResult<String> {
        if let Some(expected) = &self.api_key {
            let presented = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim);
            if presented != Some(expected.as_str()) {
                return Err(GraphError::Unauthenticated(
                    "missing or invalid bearer token".to_string(),
                ));
            }
        }

        headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| GraphError::Unauthenticated(format!("{} header is required", USER_HEADER)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn resolves_user_header() {
        let identity = HeaderIdentity::new(None);
        assert_eq!(identity.resolve(&headers(&[("x-user-id", "alice")])).unwrap(), "alice");
        assert_eq!(
            identity.resolve(&headers(&[])).unwrap_err().code(),
            "UNAUTHENTICATED"
        );
    }

    #[test]
    fn api_key_is_enforced_when_configured() {
        let identity = HeaderIdentity::new(Some("secret".into()));
        assert!(identity.resolve(&headers(&[("x-user-id", "alice")])).is_err());
        assert!(identity
            .resolve(&headers(&[
                ("x-user-id", "alice"),
                ("authorization", "Bearer wrong")
            ]))
            .is_err());
        assert_eq!(
            identity
                .resolve(&headers(&[
                    ("x-user-id", "alice"),
                    ("authorization", "Bearer secret")
                ]))
                .unwrap(),
            "alice"
        );
    }
}

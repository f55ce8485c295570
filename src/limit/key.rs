//! Rate limit key composition.

/// Per-request identity supplied by the surrounding framework.
///
/// Authentication happens outside this layer; all the limiter sees is an
/// optional authenticated user id, the client address, and the request path.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub ip: String,
    pub path: String,
}

impl RequestIdentity {
    /// The strongest identity available: user id when authenticated,
    /// client IP otherwise.
    pub fn principal(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.ip)
    }
}

/// A key that uniquely identifies one counter in the store.
///
/// Composed as `{strategy}:{identity}` or `{strategy}:{identity}:{path}`.
/// The strategy name is the leading component and contains no `:`, so keys
/// can never collide across strategies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Build a key from its components.
    pub fn new(strategy: &str, identity: &str, path: Option<&str>) -> Self {
        match path {
            Some(p) => Self(format!("{}:{}:{}", strategy, identity, p)),
            None => Self(format!("{}:{}", strategy, identity)),
        }
    }

    /// Wrap an already-composed key, as received by admin endpoints.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_without_path() {
        let key = RateLimitKey::new("auth", "10.0.0.1", None);
        assert_eq!(key.as_str(), "auth:10.0.0.1");
    }

    #[test]
    fn test_key_with_path() {
        let key = RateLimitKey::new("general", "user-7", Some("/api/contacts"));
        assert_eq!(key.as_str(), "general:user-7:/api/contacts");
    }

    #[test]
    fn test_keys_distinct_across_strategies() {
        let a = RateLimitKey::new("auth", "10.0.0.1", None);
        let b = RateLimitKey::new("general", "10.0.0.1", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_principal_prefers_user_id() {
        let id = RequestIdentity {
            user_id: Some("user-7".into()),
            ip: "10.0.0.1".into(),
            path: "/api/chat".into(),
        };
        assert_eq!(id.principal(), "user-7");

        let anon = RequestIdentity {
            user_id: None,
            ip: "10.0.0.1".into(),
            path: "/api/chat".into(),
        };
        assert_eq!(anon.principal(), "10.0.0.1");
    }
}

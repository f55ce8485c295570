//! Strategy definitions and the registry that resolves them.
//!
//! Strategies form a closed set: every limitable surface of the API maps to
//! one variant of [`StrategyId`], and each variant carries a typed,
//! startup-validated [`StrategyDefinition`]. There is no per-request string
//! lookup into an open table; an unrecognised name in configuration or at
//! the middleware seam is a configuration error.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

use super::key::{RateLimitKey, RequestIdentity};

/// The closed set of rate limit strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    /// Baseline limit applied to all API traffic.
    General,
    /// Login and credential endpoints; violations escalate to a block.
    Auth,
    /// AI chat assistant endpoints.
    Chat,
    /// Resume generation endpoints.
    ResumeGeneration,
    /// Job search aggregation endpoints.
    JobSearch,
    /// File upload endpoints.
    Upload,
}

impl StrategyId {
    pub const ALL: [StrategyId; 6] = [
        StrategyId::General,
        StrategyId::Auth,
        StrategyId::Chat,
        StrategyId::ResumeGeneration,
        StrategyId::JobSearch,
        StrategyId::Upload,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyId::General => "general",
            StrategyId::Auth => "auth",
            StrategyId::Chat => "chat",
            StrategyId::ResumeGeneration => "resume_generation",
            StrategyId::JobSearch => "job_search",
            StrategyId::Upload => "upload",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.name() == name)
    }
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which request fields feed the key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Authenticated user id when present, client IP otherwise.
    UserOrIp,
    /// Client IP only (pre-authentication endpoints).
    IpOnly,
    /// User-or-IP plus the request path, for per-endpoint quotas.
    UserOrIpAndPath,
}

/// Immutable, validated configuration for one strategy.
#[derive(Debug, Clone)]
pub struct StrategyDefinition {
    pub id: StrategyId,
    pub key_source: KeySource,
    pub limit_points: u64,
    pub window: Duration,
    /// When set, a limiter rejection escalates into a block of this length.
    pub block_duration: Option<Duration>,
    /// User-facing message returned with 429 responses.
    pub message: String,
}

impl StrategyDefinition {
    /// Derive the counter key for a request.
    pub fn key_for(&self, identity: &RequestIdentity) -> RateLimitKey {
        match self.key_source {
            KeySource::UserOrIp => {
                RateLimitKey::new(self.id.name(), identity.principal(), None)
            }
            KeySource::IpOnly => RateLimitKey::new(self.id.name(), &identity.ip, None),
            KeySource::UserOrIpAndPath => RateLimitKey::new(
                self.id.name(),
                identity.principal(),
                Some(&identity.path),
            ),
        }
    }

    /// Apply per-route overrides, leaving everything else intact.
    pub fn with_overrides(&self, overrides: &LimitOverrides) -> StrategyDefinition {
        let mut def = self.clone();
        if let Some(points) = overrides.limit_points {
            def.limit_points = points;
        }
        if let Some(window) = overrides.window {
            def.window = window;
        }
        def
    }

    fn validate(&self) -> Result<()> {
        if self.limit_points == 0 {
            return Err(GatekeeperError::Config(format!(
                "strategy '{}' has zero limit points",
                self.id
            )));
        }
        if self.window.is_zero() {
            return Err(GatekeeperError::Config(format!(
                "strategy '{}' has a zero-length window",
                self.id
            )));
        }
        if let Some(block) = self.block_duration {
            if block.is_zero() {
                return Err(GatekeeperError::Config(format!(
                    "strategy '{}' declares a zero-length block duration",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Per-route overrides accepted by the `limit` middleware constructor.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitOverrides {
    pub limit_points: Option<u64>,
    pub window: Option<Duration>,
}

/// Startup-built map of strategy id to definition. Read-only after build.
pub struct StrategyRegistry {
    definitions: HashMap<StrategyId, StrategyDefinition>,
}

impl StrategyRegistry {
    /// The built-in strategy table for the career platform API.
    pub fn builtin() -> Self {
        let definitions = [
            StrategyDefinition {
                id: StrategyId::General,
                key_source: KeySource::UserOrIp,
                limit_points: 100,
                window: Duration::from_secs(60),
                block_duration: None,
                message: "Too many requests, please slow down.".into(),
            },
            StrategyDefinition {
                id: StrategyId::Auth,
                key_source: KeySource::IpOnly,
                limit_points: 5,
                window: Duration::from_secs(60),
                block_duration: Some(Duration::from_secs(900)),
                message: "Too many login attempts. Try again later.".into(),
            },
            StrategyDefinition {
                id: StrategyId::Chat,
                key_source: KeySource::UserOrIp,
                limit_points: 20,
                window: Duration::from_secs(60),
                block_duration: None,
                message: "Chat rate limit reached. Give it a minute.".into(),
            },
            StrategyDefinition {
                id: StrategyId::ResumeGeneration,
                key_source: KeySource::UserOrIp,
                limit_points: 10,
                window: Duration::from_secs(3600),
                block_duration: None,
                message: "Resume generation limit reached for this hour.".into(),
            },
            StrategyDefinition {
                id: StrategyId::JobSearch,
                key_source: KeySource::UserOrIpAndPath,
                limit_points: 30,
                window: Duration::from_secs(60),
                block_duration: None,
                message: "Job search rate limit reached.".into(),
            },
            StrategyDefinition {
                id: StrategyId::Upload,
                key_source: KeySource::UserOrIp,
                limit_points: 10,
                window: Duration::from_secs(300),
                block_duration: Some(Duration::from_secs(600)),
                message: "Upload limit reached. Try again later.".into(),
            },
        ]
        .into_iter()
        .map(|def| (def.id, def))
        .collect();

        Self { definitions }
    }

    /// Build a registry from validated definitions, replacing built-in
    /// entries where ids collide. Fails on the first invalid definition.
    pub fn with_definitions(definitions: Vec<StrategyDefinition>) -> Result<Self> {
        let mut registry = Self::builtin();
        for def in definitions {
            def.validate()?;
            registry.definitions.insert(def.id, def);
        }
        Ok(registry)
    }

    pub fn get(&self, id: StrategyId) -> &StrategyDefinition {
        // The builtin table covers every variant, so the lookup is total.
        &self.definitions[&id]
    }

    /// Resolve a strategy by its configured name.
    pub fn resolve(&self, name: &str) -> Result<&StrategyDefinition> {
        let id = StrategyId::from_name(name)
            .ok_or_else(|| GatekeeperError::UnknownStrategy(name.to_string()))?;
        Ok(self.get(id))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_id() {
        let registry = StrategyRegistry::builtin();
        for id in StrategyId::ALL {
            assert_eq!(registry.get(id).id, id);
        }
    }

    #[test]
    fn test_name_roundtrip() {
        for id in StrategyId::ALL {
            assert_eq!(StrategyId::from_name(id.name()), Some(id));
        }
        assert_eq!(StrategyId::from_name("no_such_strategy"), None);
    }

    #[test]
    fn test_resolve_unknown_strategy_is_config_error() {
        let registry = StrategyRegistry::builtin();
        let err = registry.resolve("no_such_strategy").unwrap_err();
        assert!(matches!(err, GatekeeperError::UnknownStrategy(_)));
    }

    #[test]
    fn test_key_for_respects_key_source() {
        let registry = StrategyRegistry::builtin();
        let identity = RequestIdentity {
            user_id: Some("user-7".into()),
            ip: "10.0.0.1".into(),
            path: "/api/jobs/search".into(),
        };

        // Auth keys by IP even for authenticated users.
        let auth = registry.get(StrategyId::Auth).key_for(&identity);
        assert_eq!(auth.as_str(), "auth:10.0.0.1");

        let general = registry.get(StrategyId::General).key_for(&identity);
        assert_eq!(general.as_str(), "general:user-7");

        let search = registry.get(StrategyId::JobSearch).key_for(&identity);
        assert_eq!(search.as_str(), "job_search:user-7:/api/jobs/search");
    }

    #[test]
    fn test_with_definitions_rejects_zero_points() {
        let bad = StrategyDefinition {
            id: StrategyId::Chat,
            key_source: KeySource::UserOrIp,
            limit_points: 0,
            window: Duration::from_secs(60),
            block_duration: None,
            message: "".into(),
        };
        assert!(StrategyRegistry::with_definitions(vec![bad]).is_err());
    }

    #[test]
    fn test_overrides_replace_only_named_fields() {
        let registry = StrategyRegistry::builtin();
        let def = registry.get(StrategyId::General).with_overrides(&LimitOverrides {
            limit_points: Some(10),
            window: None,
        });
        assert_eq!(def.limit_points, 10);
        assert_eq!(def.window, Duration::from_secs(60));
        assert_eq!(def.id, StrategyId::General);
    }
}

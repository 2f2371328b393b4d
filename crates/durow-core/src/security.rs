//! Capability token validation.
//!
//! Every execution request carries a `CapabilityToken` proving the caller is
//! allowed to ask for it. Validation short-circuits before the orchestrator
//! or isolation manager take any action, so an unauthorized request has no
//! partial side effects. Tokens are consumed read-only and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Permission scopes recognized by the engine.
pub mod scopes {
    /// Start workflows, execute sandboxed code.
    pub const EXECUTE: &str = "worker:execute";
    /// Query run status and audit records.
    pub const READ: &str = "worker:read";
    /// Administer schedules.
    pub const SCHEDULE: &str = "worker:schedule";
}

/// Caller credential: identity, granted scopes, expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityToken {
    pub subject: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl CapabilityToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Validate a token against a required scope.
///
/// Checks in order: presence, expiry, scope membership. The first failure
/// wins; callers must not touch any engine state before this returns `Ok`.
pub fn authorize(token: Option<&CapabilityToken>, required: &str) -> Result<(), EngineError> {
    let token = token.ok_or_else(|| {
        EngineError::Unauthorized("No capability token provided".to_string())
    })?;

    if token.is_expired(Utc::now()) {
        return Err(EngineError::Expired);
    }

    if !token.has_scope(required) {
        return Err(EngineError::Unauthorized(format!(
            "Token for '{}' lacks required scope '{}'",
            token.subject, required
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(scopes: &[&str], ttl_secs: i64) -> CapabilityToken {
        CapabilityToken {
            subject: "tester".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_missing_token_is_unauthorized() {
        assert!(matches!(
            authorize(None, scopes::EXECUTE),
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token_beats_scope_check() {
        // Expired token with the right scope still fails with Expired.
        let t = token(&[scopes::EXECUTE], -10);
        assert!(matches!(
            authorize(Some(&t), scopes::EXECUTE),
            Err(EngineError::Expired)
        ));
    }

    #[test]
    fn test_scope_membership() {
        let t = token(&[scopes::READ], 60);
        assert!(matches!(
            authorize(Some(&t), scopes::EXECUTE),
            Err(EngineError::Unauthorized(_))
        ));
        assert!(authorize(Some(&t), scopes::READ).is_ok());
    }
}

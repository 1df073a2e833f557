//! Audit logging for token lifecycle and login events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event
//! in a single `audit` field, queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.created` | Any token is created |
//! | `token.modified` | A user token's mutable fields change |
//! | `token.revoked` | A token is deleted, directly or by cascade |
//! | `login.succeeded` | An upstream login completes |
//! | `login.failed` | An upstream login fails |

use serde::Serialize;

use crate::models::TokenType;

/// Structured audit event for a token or login lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.created"`).
    pub event: &'static str,
    /// Username the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Key of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Kind of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    /// Scopes carried by the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Delegated service, for internal tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Who performed the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Client IP, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Human-readable reason for failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Correlation ID echoed to the user on login failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AuditEvent {
    fn empty(event: &'static str) -> Self {
        Self {
            event,
            username: None,
            key: None,
            token_type: None,
            scopes: None,
            service: None,
            actor: None,
            ip_address: None,
            reason: None,
            correlation_id: None,
        }
    }

    /// A `token.created` event.
    #[must_use]
    pub fn created(
        username: &str,
        key: &str,
        token_type: TokenType,
        scopes: &[String],
        service: Option<&str>,
        actor: &str,
        ip_address: Option<&str>,
    ) -> Self {
        Self {
            username: Some(username.to_string()),
            key: Some(key.to_string()),
            token_type: Some(token_type),
            scopes: Some(scopes.to_vec()),
            service: service.map(str::to_string),
            actor: Some(actor.to_string()),
            ip_address: ip_address.map(str::to_string),
            ..Self::empty("token.created")
        }
    }

    /// A `token.modified` event.
    #[must_use]
    pub fn modified(username: &str, key: &str, actor: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            key: Some(key.to_string()),
            actor: Some(actor.to_string()),
            ..Self::empty("token.modified")
        }
    }

    /// A `token.revoked` event.
    #[must_use]
    pub fn revoked(username: &str, key: &str, actor: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            key: Some(key.to_string()),
            actor: Some(actor.to_string()),
            ..Self::empty("token.revoked")
        }
    }

    /// A `login.succeeded` event.
    #[must_use]
    pub fn login_succeeded(username: &str, key: &str, scopes: &[String]) -> Self {
        Self {
            username: Some(username.to_string()),
            key: Some(key.to_string()),
            scopes: Some(scopes.to_vec()),
            ..Self::empty("login.succeeded")
        }
    }

    /// A `login.failed` event.
    #[must_use]
    pub fn login_failed(reason: &str, correlation_id: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            ..Self::empty("login.failed")
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "token audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_event_carries_token_fields() {
        // GIVEN/WHEN: a creation event
        let event = AuditEvent::created(
            "alice",
            "somekey",
            TokenType::Internal,
            &["read:all".to_string()],
            Some("nublado"),
            "alice",
            Some("192.0.2.4"),
        );

        // THEN: all fields present
        assert_eq!(event.event, "token.created");
        assert_eq!(event.service.as_deref(), Some("nublado"));
        assert_eq!(event.ip_address.as_deref(), Some("192.0.2.4"));
    }

    #[test]
    fn failure_event_carries_reason_and_correlation() {
        let event = AuditEvent::login_failed("state mismatch", "abc-123");
        assert_eq!(event.event, "login.failed");
        assert_eq!(event.reason.as_deref(), Some("state mismatch"));
        assert_eq!(event.correlation_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn events_serialize_without_empty_fields() {
        let event = AuditEvent::revoked("alice", "somekey", "admin");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "token.revoked");
        assert!(json.get("reason").is_none());
        assert!(json.get("scopes").is_none());
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::modified("alice", "somekey", "alice"));
    }
}

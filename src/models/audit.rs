use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit row per logical call through the gateway subtree, success or
/// failure. Append-only; never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: Uuid,
    pub principal_id: Option<Uuid>,
    pub backend_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    /// HTTP status returned to the caller.
    pub status: i16,
    /// Internal error kind — recorded even when the wire response is masked
    /// (an RBAC execute deny audits as `forbidden` while the wire says 404).
    pub error_kind: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditEntry {
    pub fn new(request_id: Uuid, method: impl Into<String>, path: impl Into<String>) -> Self {
        AuditEntry {
            request_id,
            principal_id: None,
            backend_id: None,
            method: method.into(),
            path: path.into(),
            status: 0,
            error_kind: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Filters accepted by the audit query endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub server_id: Option<Uuid>,
    pub method: Option<String>,
}

impl AuditQuery {
    /// Default page size when the caller does not pass `limit`.
    pub const DEFAULT_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limit_is_100() {
        let q = AuditQuery::default();
        assert_eq!(q.limit(), 100);
        assert_eq!(q.offset(), 0);
    }

    #[test]
    fn test_limit_clamped() {
        let q = AuditQuery {
            limit: Some(50_000),
            ..Default::default()
        };
        assert_eq!(q.limit(), 1000);
        let q = AuditQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.limit(), 1);
    }
}

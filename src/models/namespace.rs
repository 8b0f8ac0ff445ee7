use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named grouping of backends — the unit of resource-RBAC grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Access level a role holds on a namespace. `Execute` implies `View` at
/// evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    View,
    Execute,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::View => "view",
            AccessLevel::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "view" => Some(AccessLevel::View),
            "execute" => Some(AccessLevel::Execute),
            _ => None,
        }
    }
}

/// One (role, namespace) grant row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceGrant {
    pub role_name: String,
    pub namespace_id: Uuid,
    pub level: AccessLevel,
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_implies_view_by_ordering() {
        assert!(AccessLevel::Execute >= AccessLevel::View);
        assert!(AccessLevel::View < AccessLevel::Execute);
    }

    #[test]
    fn test_level_roundtrip() {
        assert_eq!(AccessLevel::parse("view"), Some(AccessLevel::View));
        assert_eq!(AccessLevel::parse("execute"), Some(AccessLevel::Execute));
        assert_eq!(AccessLevel::parse("write"), None);
    }
}

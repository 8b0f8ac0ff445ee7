//! Backend server entities — the registry's source of truth for where and
//! how to reach each MCP server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire transport a backend speaks. Drives the proxy branch per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Http,
    Sse,
    StreamableHttp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Sse => "sse",
            Transport::StreamableHttp => "streamable_http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Transport::Http),
            "sse" => Some(Transport::Sse),
            "streamable_http" => Some(Transport::StreamableHttp),
            _ => None,
        }
    }
}

/// How the gateway authenticates to the backend. The caller's own
/// credentials are never forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendAuth {
    None,
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// Arbitrary header, e.g. `X-Api-Key: <value>`
    Header { name: String, value: String },
}

impl BackendAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendAuth::None => "none",
            BackendAuth::Bearer { .. } => "bearer",
            BackendAuth::Header { .. } => "header",
        }
    }
}

/// A registered MCP backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub transport: Transport,
    /// Forwarded as `MCP-Protocol-Version` when set.
    pub protocol_version: Option<String>,
    /// Logical-call deadline. Always > 0.
    pub timeout_seconds: i32,
    pub max_connections: i32,
    pub health_check_url: Option<String>,
    pub health_check_interval_seconds: i32,
    pub auth: BackendAuth,
    /// Empty = every tool allowed.
    pub tool_allowlist: Vec<String>,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backend {
    /// Allowlist gate for `tools/call`. Runs after RBAC execute access.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        self.tool_allowlist.is_empty() || self.tool_allowlist.iter().any(|t| t == tool)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Current health of one backend. Exactly one record per backend,
/// overwritten by the prober on each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub backend_id: Uuid,
    pub status: HealthStatus,
    pub last_check_at: DateTime<Utc>,
    pub response_ms: Option<i64>,
    pub error: Option<String>,
}

// ── Tests ──────────────────────────────────────────────────────

//! Backend registry — the single writer for Backend and HealthRecord rows.
//!
//! CRUD plus toggle, with the SSRF policy enforced on every URL that enters
//! the system. Readers elsewhere take snapshots through the store and may
//! observe up to one probe cycle of staleness.

pub mod health;
pub mod ssrf;

use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::backend::{Backend, BackendAuth, Transport};
use crate::store::postgres::{conflict_on_unique, NewBackend, PgStore};
use ssrf::SsrfPolicy;

/// Create/update request body for a backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    pub url: String,
    pub transport: String,
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: i32,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_timeout() -> i32 {
    30
}
fn default_max_connections() -> i32 {
    8
}
fn default_health_interval() -> i32 {
    30
}
fn default_auth_type() -> String {
    "none".to_string()
}

pub struct BackendRegistry {
    store: PgStore,
    ssrf: SsrfPolicy,
}

impl BackendRegistry {
    pub fn new(store: PgStore, ssrf: SsrfPolicy) -> Self {
        Self { store, ssrf }
    }

    pub fn store(&self) -> &PgStore {
        &self.store
    }

    /// Validate a spec into an insertable backend. Runs the SSRF policy
    /// against both the backend URL and any separate health-check URL.
    pub async fn validate_spec(&self, spec: &BackendSpec) -> Result<NewBackend, AppError> {
        if spec.name.trim().is_empty() {
            return Err(AppError::Validation("name is required".into()));
        }
        let transport = Transport::parse(&spec.transport).ok_or_else(|| {
            AppError::Validation(format!(
                "transport must be one of http|sse|streamable_http, got '{}'",
                spec.transport
            ))
        })?;
        if spec.timeout_seconds <= 0 {
            return Err(AppError::Validation("timeout_seconds must be positive".into()));
        }
        if spec.max_connections <= 0 {
            return Err(AppError::Validation("max_connections must be positive".into()));
        }

        let auth = match spec.auth_type.as_str() {
            "none" => BackendAuth::None,
            "bearer" => BackendAuth::Bearer {
                token: spec
                    .auth_token
                    .clone()
                    .ok_or_else(|| AppError::Validation("auth_token is required for bearer".into()))?,
            },
            "header" => BackendAuth::Header {
                name: spec
                    .auth_header
                    .clone()
                    .ok_or_else(|| AppError::Validation("auth_header is required for header".into()))?,
                value: spec
                    .auth_token
                    .clone()
                    .ok_or_else(|| AppError::Validation("auth_token is required for header".into()))?,
            },
            other => {
                return Err(AppError::Validation(format!(
                    "auth_type must be one of none|bearer|header, got '{}'",
                    other
                )))
            }
        };

        self.ssrf.validate_url(&spec.url).await?;
        if let Some(health_url) = &spec.health_check_url {
            self.ssrf.validate_url(health_url).await?;
        }

        Ok(NewBackend {
            name: spec.name.trim().to_string(),
            url: spec.url.clone(),
            transport,
            protocol_version: spec.protocol_version.clone(),
            timeout_seconds: spec.timeout_seconds,
            max_connections: spec.max_connections,
            health_check_url: spec.health_check_url.clone(),
            health_check_interval_seconds: spec.health_check_interval_seconds,
            auth,
            tool_allowlist: spec.tool_allowlist.clone(),
            tags: spec.tags.clone(),
        })
    }

    pub async fn create(&self, spec: &BackendSpec) -> Result<Backend, AppError> {
        let new = self.validate_spec(spec).await?;
        self.store
            .insert_backend(&new)
            .await
            .map_err(|e| conflict_on_unique(e, "backend name"))
    }

    /// Update in place. Returns the previous row too so callers can evict
    /// cached sessions when the transport or URL changed.
    pub async fn update(
        &self,
        id: Uuid,
        spec: &BackendSpec,
    ) -> Result<(Backend, Backend), AppError> {
        let previous = self
            .store
            .get_backend(id)
            .await?
            .ok_or(AppError::NotFound)?;
        let new = self.validate_spec(spec).await?;
        let updated = self
            .store
            .update_backend(id, &new)
            .await
            .map_err(|e| conflict_on_unique(e, "backend name"))?
            .ok_or(AppError::NotFound)?;
        Ok((previous, updated))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        if !self.store.delete_backend(id).await? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn toggle(&self, id: Uuid) -> Result<bool, AppError> {
        self.store
            .toggle_backend(id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn get(&self, id: Uuid) -> Result<Backend, AppError> {
        self.store.get_backend(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn list(&self) -> Result<Vec<Backend>, AppError> {
        Ok(self.store.list_backends(false).await?)
    }

    /// Build an ephemeral, never-persisted backend for test-connection.
    pub async fn candidate(&self, spec: &BackendSpec) -> Result<Backend, AppError> {
        let new = self.validate_spec(spec).await?;
        let now = chrono::Utc::now();
        Ok(Backend {
            id: Uuid::new_v4(),
            name: new.name,
            url: new.url,
            transport: new.transport,
            protocol_version: new.protocol_version,
            timeout_seconds: new.timeout_seconds,
            max_connections: new.max_connections,
            health_check_url: new.health_check_url,
            health_check_interval_seconds: new.health_check_interval_seconds,
            auth: new.auth,
            tool_allowlist: new.tool_allowlist,
            is_active: true,
            tags: new.tags,
            created_at: now,
            updated_at: now,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: BackendSpec = serde_json::from_value(serde_json::json!({
            "name": "mock",
            "url": "http://mock:9001",
            "transport": "http"
        }))
        .unwrap();
        assert_eq!(spec.timeout_seconds, 30);
        assert_eq!(spec.max_connections, 8);
        assert_eq!(spec.auth_type, "none");
        assert!(spec.tool_allowlist.is_empty());
    }

    #[test]
    fn test_spec_rejects_unknown_transport_at_validation() {
        let spec: BackendSpec = serde_json::from_value(serde_json::json!({
            "name": "mock",
            "url": "http://mock:9001",
            "transport": "grpc"
        }))
        .unwrap();
        assert_eq!(Transport::parse(&spec.transport), None);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::audit::AuditQuery;
use crate::models::backend::{Backend, BackendAuth, HealthRecord, HealthStatus, Transport};
use crate::models::namespace::{AccessLevel, Namespace, NamespaceGrant};
use crate::models::principal::{ApiKeyMeta, Principal, Provider, Role};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &crate::config::DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_open)
            .min_connections(cfg.max_idle)
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    // -- Principal Operations --

    pub async fn get_principal(&self, id: Uuid) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(
            "SELECT id, display_name, email, is_active, provider, external_id, created_at
             FROM principals WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_principal(row).await
    }

    pub async fn get_principal_by_email(&self, email: &str) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(
            "SELECT id, display_name, email, is_active, provider, external_id, created_at
             FROM principals WHERE email = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_principal(row).await
    }

    pub async fn get_principal_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> anyhow::Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(
            "SELECT id, display_name, email, is_active, provider, external_id, created_at
             FROM principals WHERE provider = $1 AND external_id = $2",
        )
        .bind(provider.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_principal(row).await
    }

    async fn hydrate_principal(
        &self,
        row: Option<PrincipalRow>,
    ) -> anyhow::Result<Option<Principal>> {
        let Some(row) = row else { return Ok(None) };
        let roles = self.roles_of(row.id).await?;
        Ok(Some(row.into_principal(roles)))
    }

    async fn roles_of(&self, principal_id: Uuid) -> anyhow::Result<Vec<String>> {
        let roles = sqlx::query_scalar::<_, String>(
            "SELECT role_name FROM principal_roles WHERE principal_id = $1 ORDER BY role_name",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    pub async fn list_principals(&self) -> anyhow::Result<Vec<Principal>> {
        let rows = sqlx::query_as::<_, PrincipalRow>(
            "SELECT id, display_name, email, is_active, provider, external_id, created_at
             FROM principals ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut principals = Vec::with_capacity(rows.len());
        for row in rows {
            let roles = self.roles_of(row.id).await?;
            principals.push(row.into_principal(roles));
        }
        Ok(principals)
    }

    pub async fn count_principals(&self) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM principals")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Create a local-provider principal. The email unique constraint maps
    /// to Conflict at the API layer.
    pub async fn create_local_principal(
        &self,
        email: &str,
        display_name: &str,
        password_hash: &str,
        roles: &[String],
    ) -> anyhow::Result<Principal> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, PrincipalRow>(
            "INSERT INTO principals (email, display_name, provider)
             VALUES (lower($1), $2, 'local')
             RETURNING id, display_name, email, is_active, provider, external_id, created_at",
        )
        .bind(email)
        .bind(display_name)
        .fetch_one(&mut *tx)
        .await?;

        for role in roles {
            sqlx::query(
                "INSERT INTO principal_roles (principal_id, role_name) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(row.id)
            .bind(role)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO credentials (principal_id, kind, material) VALUES ($1, 'password-hash', $2)",
        )
        .bind(row.id)
        .bind(password_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        let roles = roles.to_vec();
        Ok(row.into_principal(roles))
    }

    /// Create-or-refresh a principal sourced from LDAP or OIDC, keyed by
    /// (provider, external id). Role set is replaced on every login so
    /// directory changes take effect immediately.
    pub async fn upsert_external_principal(
        &self,
        provider: Provider,
        external_id: &str,
        email: &str,
        display_name: &str,
        roles: &[String],
    ) -> anyhow::Result<Principal> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, PrincipalRow>(
            "INSERT INTO principals (email, display_name, provider, external_id)
             VALUES (lower($1), $2, $3, $4)
             ON CONFLICT (provider, external_id) WHERE external_id IS NOT NULL
             DO UPDATE SET display_name = EXCLUDED.display_name, email = EXCLUDED.email
             RETURNING id, display_name, email, is_active, provider, external_id, created_at",
        )
        .bind(email)
        .bind(display_name)
        .bind(provider.as_str())
        .bind(external_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM principal_roles WHERE principal_id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        for role in roles {
            sqlx::query(
                "INSERT INTO principal_roles (principal_id, role_name) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(row.id)
            .bind(role)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.into_principal(roles.to_vec()))
    }

    /// Soft activate/deactivate. Principals are never hard-deleted while
    /// audit rows reference them.
    pub async fn set_principal_active(&self, id: Uuid, active: bool) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE principals SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_password_hash(&self, principal_id: Uuid) -> anyhow::Result<Option<String>> {
        let hash = sqlx::query_scalar::<_, String>(
            "SELECT material FROM credentials
             WHERE principal_id = $1 AND kind = 'password-hash' AND revoked_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash)
    }

    pub async fn set_password_hash(&self, principal_id: Uuid, hash: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE credentials SET revoked_at = NOW()
             WHERE principal_id = $1 AND kind = 'password-hash' AND revoked_at IS NULL",
        )
        .bind(principal_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO credentials (principal_id, kind, material) VALUES ($1, 'password-hash', $2)",
        )
        .bind(principal_id)
        .bind(hash)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // -- API Key Operations --

    pub async fn find_api_keys_by_prefix(
        &self,
        prefix: &str,
    ) -> anyhow::Result<Vec<ApiKeyCredentialRow>> {
        let rows = sqlx::query_as::<_, ApiKeyCredentialRow>(
            "SELECT id, principal_id, material, expires_at FROM credentials
             WHERE kind = 'api-key-hash' AND key_prefix = $1 AND revoked_at IS NULL",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a new API key credential. The partial unique index on active
    /// prefixes makes a collision surface as a database error; callers
    /// regenerate and retry.
    pub async fn insert_api_key(
        &self,
        principal_id: Uuid,
        key_prefix: &str,
        digest: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO credentials (principal_id, kind, material, key_prefix, expires_at)
             VALUES ($1, 'api-key-hash', $2, $3, $4)
             RETURNING id",
        )
        .bind(principal_id)
        .bind(digest)
        .bind(key_prefix)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_api_keys(&self, principal_id: Uuid) -> anyhow::Result<Vec<ApiKeyMeta>> {
        let rows = sqlx::query_as::<_, ApiKeyMetaRow>(
            "SELECT id, key_prefix, created_at, expires_at FROM credentials
             WHERE principal_id = $1 AND kind = 'api-key-hash' AND revoked_at IS NULL
             ORDER BY created_at DESC",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ApiKeyMeta {
                id: r.id,
                key_prefix: r.key_prefix.unwrap_or_default(),
                created_at: r.created_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    pub async fn revoke_api_key(&self, id: Uuid, principal_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE credentials SET revoked_at = NOW()
             WHERE id = $1 AND principal_id = $2 AND kind = 'api-key-hash' AND revoked_at IS NULL",
        )
        .bind(id)
        .bind(principal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Role Operations --

    pub async fn list_roles(&self) -> anyhow::Result<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT name, built_in, description FROM roles ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Role {
                name: r.name,
                built_in: r.built_in,
                description: r.description,
            })
            .collect())
    }

    // -- Backend Operations --

    pub async fn insert_backend(&self, new: &NewBackend) -> Result<Backend, sqlx::Error> {
        let row = sqlx::query_as::<_, BackendRow>(
            "INSERT INTO backends (
                name, url, transport, protocol_version, timeout_seconds, max_connections,
                health_check_url, health_check_interval_seconds,
                auth_type, auth_token, auth_header, tool_allowlist, tags
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING id, name, url, transport, protocol_version, timeout_seconds,
                       max_connections, health_check_url, health_check_interval_seconds,
                       auth_type, auth_token, auth_header, tool_allowlist, is_active, tags,
                       created_at, updated_at",
        )
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.transport.as_str())
        .bind(&new.protocol_version)
        .bind(new.timeout_seconds)
        .bind(new.max_connections)
        .bind(&new.health_check_url)
        .bind(new.health_check_interval_seconds)
        .bind(new.auth.kind())
        .bind(auth_token_of(&new.auth))
        .bind(auth_header_of(&new.auth))
        .bind(serde_json::json!(new.tool_allowlist))
        .bind(serde_json::json!(new.tags))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_backend())
    }

    pub async fn update_backend(
        &self,
        id: Uuid,
        new: &NewBackend,
    ) -> Result<Option<Backend>, sqlx::Error> {
        let row = sqlx::query_as::<_, BackendRow>(
            "UPDATE backends SET
                name = $2, url = $3, transport = $4, protocol_version = $5,
                timeout_seconds = $6, max_connections = $7,
                health_check_url = $8, health_check_interval_seconds = $9,
                auth_type = $10, auth_token = $11, auth_header = $12,
                tool_allowlist = $13, tags = $14, updated_at = NOW()
             WHERE id = $1
             RETURNING id, name, url, transport, protocol_version, timeout_seconds,
                       max_connections, health_check_url, health_check_interval_seconds,
                       auth_type, auth_token, auth_header, tool_allowlist, is_active, tags,
                       created_at, updated_at",
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.url)
        .bind(new.transport.as_str())
        .bind(&new.protocol_version)
        .bind(new.timeout_seconds)
        .bind(new.max_connections)
        .bind(&new.health_check_url)
        .bind(new.health_check_interval_seconds)
        .bind(new.auth.kind())
        .bind(auth_token_of(&new.auth))
        .bind(auth_header_of(&new.auth))
        .bind(serde_json::json!(new.tool_allowlist))
        .bind(serde_json::json!(new.tags))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BackendRow::into_backend))
    }

    pub async fn get_backend(&self, id: Uuid) -> anyhow::Result<Option<Backend>> {
        let row = sqlx::query_as::<_, BackendRow>(
            "SELECT id, name, url, transport, protocol_version, timeout_seconds,
                    max_connections, health_check_url, health_check_interval_seconds,
                    auth_type, auth_token, auth_header, tool_allowlist, is_active, tags,
                    created_at, updated_at
             FROM backends WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BackendRow::into_backend))
    }

    pub async fn list_backends(&self, active_only: bool) -> anyhow::Result<Vec<Backend>> {
        let query = if active_only {
            "SELECT id, name, url, transport, protocol_version, timeout_seconds,
                    max_connections, health_check_url, health_check_interval_seconds,
                    auth_type, auth_token, auth_header, tool_allowlist, is_active, tags,
                    created_at, updated_at
             FROM backends WHERE is_active = true ORDER BY name ASC"
        } else {
            "SELECT id, name, url, transport, protocol_version, timeout_seconds,
                    max_connections, health_check_url, health_check_interval_seconds,
                    auth_type, auth_token, auth_header, tool_allowlist, is_active, tags,
                    created_at, updated_at
             FROM backends ORDER BY name ASC"
        };
        let rows = sqlx::query_as::<_, BackendRow>(query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(BackendRow::into_backend).collect())
    }

    pub async fn delete_backend(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM backends WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip the active flag; returns the new state.
    pub async fn toggle_backend(&self, id: Uuid) -> anyhow::Result<Option<bool>> {
        let state = sqlx::query_scalar::<_, bool>(
            "UPDATE backends SET is_active = NOT is_active, updated_at = NOW()
             WHERE id = $1 RETURNING is_active",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    pub async fn count_backends(&self) -> anyhow::Result<(i64, i64)> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*) FILTER (WHERE is_active),
                    COUNT(*) FILTER (WHERE NOT is_active)
             FROM backends",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    // -- Health Operations --

    pub async fn upsert_health(&self, record: &HealthRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO backend_health (backend_id, status, last_check_at, response_ms, error)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (backend_id) DO UPDATE
               SET status = EXCLUDED.status,
                   last_check_at = EXCLUDED.last_check_at,
                   response_ms = EXCLUDED.response_ms,
                   error = EXCLUDED.error",
        )
        .bind(record.backend_id)
        .bind(record.status.as_str())
        .bind(record.last_check_at)
        .bind(record.response_ms)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_health(&self, backend_id: Uuid) -> anyhow::Result<Option<HealthRecord>> {
        let row = sqlx::query_as::<_, HealthRow>(
            "SELECT backend_id, status, last_check_at, response_ms, error
             FROM backend_health WHERE backend_id = $1",
        )
        .bind(backend_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(HealthRow::into_record))
    }

    /// Every current health record joined with its backend's name — the
    /// metrics collector's pull accessor.
    pub async fn all_health(&self) -> anyhow::Result<Vec<(HealthRecord, String)>> {
        let rows = sqlx::query_as::<_, HealthWithNameRow>(
            "SELECT h.backend_id, h.status, h.last_check_at, h.response_ms, h.error, b.name
             FROM backend_health h JOIN backends b ON b.id = h.backend_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let name = r.name.clone();
                (r.into_record(), name)
            })
            .collect())
    }

    // -- Namespace Operations --

    pub async fn create_namespace(&self, name: &str) -> Result<Namespace, sqlx::Error> {
        let row = sqlx::query_as::<_, NamespaceRow>(
            "INSERT INTO namespaces (name) VALUES ($1) RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_namespace())
    }

    pub async fn list_namespaces(&self) -> anyhow::Result<Vec<Namespace>> {
        let rows = sqlx::query_as::<_, NamespaceRow>(
            "SELECT id, name, created_at FROM namespaces ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NamespaceRow::into_namespace).collect())
    }

    pub async fn get_namespace(&self, id: Uuid) -> anyhow::Result<Option<Namespace>> {
        let row = sqlx::query_as::<_, NamespaceRow>(
            "SELECT id, name, created_at FROM namespaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(NamespaceRow::into_namespace))
    }

    pub async fn delete_namespace(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM namespaces WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_backend_to_namespace(
        &self,
        namespace_id: Uuid,
        backend_id: Uuid,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO namespace_backends (namespace_id, backend_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(namespace_id)
        .bind(backend_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_backend_from_namespace(
        &self,
        namespace_id: Uuid,
        backend_id: Uuid,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM namespace_backends WHERE namespace_id = $1 AND backend_id = $2",
        )
        .bind(namespace_id)
        .bind(backend_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn backends_in_namespace(&self, namespace_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT backend_id FROM namespace_backends WHERE namespace_id = $1",
        )
        .bind(namespace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn backends_in_namespaces(&self, namespace_ids: &[Uuid]) -> anyhow::Result<Vec<Uuid>> {
        if namespace_ids.is_empty() {
            return Ok(vec![]);
        }
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT backend_id FROM namespace_backends WHERE namespace_id = ANY($1)",
        )
        .bind(namespace_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn set_role_access(
        &self,
        role: &str,
        namespace_id: Uuid,
        level: AccessLevel,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO role_namespace_access (role_name, namespace_id, level)
             VALUES ($1, $2, $3)
             ON CONFLICT (role_name, namespace_id) DO UPDATE SET level = EXCLUDED.level",
        )
        .bind(role)
        .bind(namespace_id)
        .bind(level.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_role_access(&self, role: &str, namespace_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM role_namespace_access WHERE role_name = $1 AND namespace_id = $2",
        )
        .bind(role)
        .bind(namespace_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_namespace_access(
        &self,
        namespace_id: Uuid,
    ) -> anyhow::Result<Vec<NamespaceGrant>> {
        let rows = sqlx::query_as::<_, GrantRow>(
            "SELECT role_name, namespace_id, level FROM role_namespace_access
             WHERE namespace_id = $1 ORDER BY role_name",
        )
        .bind(namespace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(GrantRow::into_grant).collect())
    }

    /// All grants held by any of the given roles — the RBAC engine's input.
    pub async fn list_role_grants(&self, roles: &[String]) -> anyhow::Result<Vec<NamespaceGrant>> {
        if roles.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query_as::<_, GrantRow>(
            "SELECT role_name, namespace_id, level FROM role_namespace_access
             WHERE role_name = ANY($1)",
        )
        .bind(roles)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(GrantRow::into_grant).collect())
    }

    // -- Audit Operations --

    pub async fn list_audit(&self, query: &AuditQuery) -> anyhow::Result<Vec<AuditRow>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, request_id, principal_id, backend_id, method, path, status,
                    error_kind, started_at, duration_ms
             FROM audit_logs
             WHERE ($3::uuid IS NULL OR backend_id = $3)
               AND ($4::text IS NULL OR method = $4)
             ORDER BY started_at DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(query.limit())
        .bind(query.offset())
        .bind(query.server_id)
        .bind(&query.method)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn auth_token_of(auth: &BackendAuth) -> Option<String> {
    match auth {
        BackendAuth::None => None,
        BackendAuth::Bearer { token } => Some(token.clone()),
        BackendAuth::Header { value, .. } => Some(value.clone()),
    }
}

fn auth_header_of(auth: &BackendAuth) -> Option<String> {
    match auth {
        BackendAuth::Header { name, .. } => Some(name.clone()),
        _ => None,
    }
}

// -- Insert payloads --

#[derive(Debug, Clone)]
pub struct NewBackend {
    pub name: String,
    pub url: String,
    pub transport: Transport,
    pub protocol_version: Option<String>,
    pub timeout_seconds: i32,
    pub max_connections: i32,
    pub health_check_url: Option<String>,
    pub health_check_interval_seconds: i32,
    pub auth: BackendAuth,
    pub tool_allowlist: Vec<String>,
    pub tags: Vec<String>,
}

// -- Row types --

#[derive(Debug, sqlx::FromRow)]
struct PrincipalRow {
    id: Uuid,
    display_name: String,
    email: String,
    is_active: bool,
    provider: String,
    external_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl PrincipalRow {
    fn into_principal(self, roles: Vec<String>) -> Principal {
        Principal {
            id: self.id,
            display_name: self.display_name,
            email: self.email,
            is_active: self.is_active,
            provider: Provider::parse(&self.provider).unwrap_or(Provider::Local),
            external_id: self.external_id,
            roles,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ApiKeyCredentialRow {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub material: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct ApiKeyMetaRow {
    id: Uuid,
    key_prefix: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    name: String,
    built_in: bool,
    description: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct BackendRow {
    id: Uuid,
    name: String,
    url: String,
    transport: String,
    protocol_version: Option<String>,
    timeout_seconds: i32,
    max_connections: i32,
    health_check_url: Option<String>,
    health_check_interval_seconds: i32,
    auth_type: String,
    auth_token: Option<String>,
    auth_header: Option<String>,
    tool_allowlist: serde_json::Value,
    is_active: bool,
    tags: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BackendRow {
    fn into_backend(self) -> Backend {
        let auth = match self.auth_type.as_str() {
            "bearer" => BackendAuth::Bearer {
                token: self.auth_token.unwrap_or_default(),
            },
            "header" => BackendAuth::Header {
                name: self.auth_header.unwrap_or_default(),
                value: self.auth_token.unwrap_or_default(),
            },
            _ => BackendAuth::None,
        };
        Backend {
            id: self.id,
            name: self.name,
            url: self.url,
            transport: Transport::parse(&self.transport).unwrap_or(Transport::Http),
            protocol_version: self.protocol_version,
            timeout_seconds: self.timeout_seconds,
            max_connections: self.max_connections,
            health_check_url: self.health_check_url,
            health_check_interval_seconds: self.health_check_interval_seconds,
            auth,
            tool_allowlist: serde_json::from_value(self.tool_allowlist).unwrap_or_default(),
            is_active: self.is_active,
            tags: serde_json::from_value(self.tags).unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HealthRow {
    backend_id: Uuid,
    status: String,
    last_check_at: DateTime<Utc>,
    response_ms: Option<i64>,
    error: Option<String>,
}

impl HealthRow {
    fn into_record(self) -> HealthRecord {
        HealthRecord {
            backend_id: self.backend_id,
            status: HealthStatus::parse(&self.status),
            last_check_at: self.last_check_at,
            response_ms: self.response_ms,
            error: self.error,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HealthWithNameRow {
    backend_id: Uuid,
    status: String,
    last_check_at: DateTime<Utc>,
    response_ms: Option<i64>,
    error: Option<String>,
    name: String,
}

impl HealthWithNameRow {
    fn into_record(self) -> HealthRecord {
        HealthRecord {
            backend_id: self.backend_id,
            status: HealthStatus::parse(&self.status),
            last_check_at: self.last_check_at,
            response_ms: self.response_ms,
            error: self.error,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NamespaceRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}

impl NamespaceRow {
    fn into_namespace(self) -> Namespace {
        Namespace {
            id: self.id,
            name: self.name,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    role_name: String,
    namespace_id: Uuid,
    level: String,
}

impl GrantRow {
    fn into_grant(self) -> NamespaceGrant {
        NamespaceGrant {
            role_name: self.role_name,
            namespace_id: self.namespace_id,
            level: AccessLevel::parse(&self.level).unwrap_or(AccessLevel::View),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct AuditRow {
    pub id: Uuid,
    pub request_id: Uuid,
    pub principal_id: Option<Uuid>,
    pub backend_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub status: i16,
    pub error_kind: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Map a unique-violation database error to Conflict, everything else to
/// Internal. Used by handlers inserting rows with unique names/emails.
pub fn conflict_on_unique(err: sqlx::Error, what: &str) -> crate::errors::AppError {
    if let sqlx::Error::Database(ref db) = err {
        if db.code().as_deref() == Some("23505") {
            return crate::errors::AppError::Conflict(format!("{} already exists", what));
        }
    }
    crate::errors::AppError::Database(err)
}

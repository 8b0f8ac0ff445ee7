//! Audit recorder — exactly one row per logical proxied call.
//!
//! Writes are fired into a detached task so a slow or failing insert never
//! fails the user call; failures are logged and counted on
//! `audit_logs_written_total{status="error"}`.

use sqlx::PgPool;

use crate::models::audit::AuditEntry;

/// Async audit writer. Fires off a Tokio task to insert the entry without
/// blocking the response path.
pub fn record(pool: PgPool, entry: AuditEntry) {
    tokio::spawn(async move {
        match insert(&pool, &entry).await {
            Ok(()) => {
                crate::metrics::audit_written("ok");
                tracing::debug!(request_id = %entry.request_id, "audit log recorded");
            }
            Err(e) => {
                crate::metrics::audit_written("error");
                tracing::error!(request_id = %entry.request_id, "failed to write audit log: {}", e);
            }
        }
    });
}

async fn insert(pool: &PgPool, entry: &AuditEntry) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (
            request_id, principal_id, backend_id, method, path, status, error_kind,
            started_at, duration_ms
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.request_id)
    .bind(entry.principal_id)
    .bind(entry.backend_id)
    .bind(&entry.method)
    .bind(&entry.path)
    .bind(entry.status)
    .bind(&entry.error_kind)
    .bind(entry.started_at)
    .bind(entry.duration_ms)
    .execute(pool)
    .await?;
    Ok(())
}

//! Health prober — one long-lived task probing active backends on a fixed
//! cadence and upserting the single current health record per backend.

use chrono::Utc;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::{Duration, Instant};

use crate::models::backend::{Backend, HealthRecord, HealthStatus};
use crate::store::postgres::PgStore;

/// Default probe cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Per-probe timeout, deliberately short — a slow health endpoint is itself
/// a signal.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthProber {
    store: PgStore,
    http: ClientWithMiddleware,
    interval: Duration,
}

/// Probe client shared with the on-demand `/servers/:id/health` endpoint.
/// Probes are idempotent GETs, so transient-failure retries are safe here,
/// unlike on the proxy path.
pub fn probe_client() -> ClientWithMiddleware {
    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(PROBE_TIMEOUT)
        .connect_timeout(Duration::from_secs(2))
        .build()
        .expect("failed to build HTTP client");
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(1);
    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

impl HealthProber {
    pub fn new(store: PgStore) -> Self {
        Self::with_interval(store, PROBE_INTERVAL)
    }

    pub fn with_interval(store: PgStore, interval: Duration) -> Self {
        Self {
            store,
            http: probe_client(),
            interval,
        }
    }

    /// Spawn the prober loop. Aborts with the returned handle on shutdown.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_cycle().await;
            }
        })
    }

    pub async fn probe_cycle(&self) {
        let backends = match self.store.list_backends(true).await {
            Ok(backends) => backends,
            Err(e) => {
                tracing::warn!("health prober could not list backends: {}", e);
                return;
            }
        };

        for backend in backends {
            let record = probe_backend(&self.http, &backend).await;
            if let Err(e) = self.store.upsert_health(&record).await {
                tracing::warn!(backend = %backend.name, "failed to store health record: {}", e);
            }
        }
    }
}

/// Probe one backend: GET its health-check URL (falling back to the backend
/// URL itself) and classify the result.
pub async fn probe_backend(http: &ClientWithMiddleware, backend: &Backend) -> HealthRecord {
    let url = backend
        .health_check_url
        .clone()
        .unwrap_or_else(|| backend.url.clone());

    let started = Instant::now();
    let outcome = http.get(&url).send().await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let (status, error) = match outcome {
        Ok(resp) => classify_status(resp.status().as_u16()),
        Err(e) => {
            let is_timeout = matches!(&e, reqwest_middleware::Error::Reqwest(r) if r.is_timeout());
            let reason = if is_timeout {
                "health check timed out".to_string()
            } else {
                format!("health check failed: {}", e)
            };
            (HealthStatus::Unhealthy, Some(reason))
        }
    };

    HealthRecord {
        backend_id: backend.id,
        status,
        last_check_at: Utc::now(),
        response_ms: Some(elapsed_ms),
        error,
    }
}

/// 2xx → healthy, 4xx → degraded, 5xx → unhealthy.
pub fn classify_status(code: u16) -> (HealthStatus, Option<String>) {
    match code {
        200..=299 => (HealthStatus::Healthy, None),
        400..=499 => (
            HealthStatus::Degraded,
            Some(format!("health endpoint returned {}", code)),
        ),
        _ => (
            HealthStatus::Unhealthy,
            Some(format!("health endpoint returned {}", code)),
        ),
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_2xx_healthy() {
        assert_eq!(classify_status(200).0, HealthStatus::Healthy);
        assert_eq!(classify_status(204).0, HealthStatus::Healthy);
        assert!(classify_status(200).1.is_none());
    }

    #[test]
    fn test_classify_4xx_degraded() {
        let (status, error) = classify_status(404);
        assert_eq!(status, HealthStatus::Degraded);
        assert!(error.unwrap().contains("404"));
    }

    #[test]
    fn test_classify_5xx_unhealthy() {
        assert_eq!(classify_status(500).0, HealthStatus::Unhealthy);
        assert_eq!(classify_status(503).0, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_classify_3xx_unhealthy() {
        // A health endpoint that redirects is not answering for itself.
        assert_eq!(classify_status(301).0, HealthStatus::Unhealthy);
    }
}

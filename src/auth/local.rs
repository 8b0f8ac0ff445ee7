//! Local password provider — bcrypt verification with in-memory lockout.
//!
//! Lockout is a DoS mitigation, not a security boundary: counters live in
//! process memory and reset on restart. A locked account short-circuits
//! before any bcrypt work is done.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::AuthError;
use crate::config::LocalAuthConfig;
use crate::models::principal::Principal;
use crate::store::postgres::PgStore;

/// Dummy hash verified for unknown emails so response timing does not
/// reveal whether the account exists.
const DUMMY_HASH: &str = "$2a$12$R9h/cIPz0gi.URNNX3kh2OPST9/PgBkqquzi.Ss7KIUgO2t0jWMUW";

/// Opportunistic purge threshold for the failure table.
const PURGE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone)]
struct FailureState {
    count: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Per-process failed-login tracker, keyed by case-folded email.
pub struct LockoutTracker {
    max_failures: u32,
    window: Duration,
    lock_duration: Duration,
    failures: DashMap<String, FailureState>,
}

impl LockoutTracker {
    pub fn new(max_failures: u32, window: Duration, lock_duration: Duration) -> Self {
        Self {
            max_failures,
            window,
            lock_duration,
            failures: DashMap::new(),
        }
    }

    pub fn is_locked(&self, email: &str) -> bool {
        match self.failures.get(email) {
            Some(state) => match state.locked_until {
                Some(until) => Instant::now() < until,
                None => false,
            },
            None => false,
        }
    }

    /// Record a failed attempt; returns true when this attempt trips the lock.
    pub fn record_failure(&self, email: &str) -> bool {
        let now = Instant::now();
        let mut tripped = false;

        let mut entry = self
            .failures
            .entry(email.to_string())
            .or_insert(FailureState {
                count: 0,
                window_start: now,
                locked_until: None,
            });

        // Expired lock or stale window restarts the count.
        let expired_lock = entry.locked_until.map(|u| now >= u).unwrap_or(false);
        if expired_lock || now.duration_since(entry.window_start) > self.window {
            entry.count = 0;
            entry.window_start = now;
            entry.locked_until = None;
        }

        entry.count += 1;
        if entry.count >= self.max_failures {
            entry.locked_until = Some(now + self.lock_duration);
            tripped = true;
        }
        drop(entry);

        if self.failures.len() > PURGE_THRESHOLD {
            self.purge_expired();
        }
        tripped
    }

    pub fn clear(&self, email: &str) {
        self.failures.remove(email);
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.failures.retain(|_, state| {
            if let Some(until) = state.locked_until {
                return now < until;
            }
            now.duration_since(state.window_start) <= self.window
        });
    }
}

pub struct LocalPasswordProvider {
    pub enabled: bool,
    pub lockout: LockoutTracker,
    bcrypt_cost: u32,
    min_password_length: usize,
}

impl LocalPasswordProvider {
    pub fn new(cfg: &LocalAuthConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            lockout: LockoutTracker::new(
                cfg.lockout.max_failures,
                Duration::from_secs(cfg.lockout.window_seconds),
                Duration::from_secs(cfg.lockout.duration_seconds),
            ),
            bcrypt_cost: cfg.bcrypt_cost,
            min_password_length: cfg.password_policy.min_length,
        }
    }

    pub async fn authenticate(
        &self,
        store: &PgStore,
        email: &str,
        password: &str,
    ) -> Result<Principal, AuthError> {
        let email = email.trim().to_lowercase();

        if self.lockout.is_locked(&email) {
            return Err(AuthError::AccountLocked);
        }

        let principal = store.get_principal_by_email(&email).await.map_err(|e| {
            tracing::error!("principal lookup failed: {}", e);
            AuthError::ProviderUnavailable
        })?;

        let stored_hash = match &principal {
            Some(p) => store
                .get_password_hash(p.id)
                .await
                .map_err(|e| {
                    tracing::error!("credential lookup failed: {}", e);
                    AuthError::ProviderUnavailable
                })?,
            None => None,
        };

        // Unknown email or non-local account: burn a verify against a dummy
        // hash so the failure path costs the same either way.
        let hash = stored_hash
            .clone()
            .unwrap_or_else(|| DUMMY_HASH.to_string());
        let password_owned = password.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            bcrypt::verify(&password_owned, &hash).unwrap_or(false)
        })
        .await
        .unwrap_or(false);

        let Some(principal) = principal else {
            self.lockout.record_failure(&email);
            return Err(AuthError::InvalidCredentials);
        };

        if !verified || stored_hash.is_none() {
            if self.lockout.record_failure(&email) {
                tracing::warn!(email = %email, "account locked after repeated failures");
            }
            return Err(AuthError::InvalidCredentials);
        }

        if !principal.is_active {
            return Err(AuthError::AccountDisabled);
        }

        self.lockout.clear(&email);
        Ok(principal)
    }

    /// Hash a new password with the configured cost.
    pub async fn hash_password(&self, password: &str) -> Result<String, crate::errors::AppError> {
        if password.len() < self.min_password_length {
            return Err(crate::errors::AppError::Validation(format!(
                "password must be at least {} characters",
                self.min_password_length
            )));
        }
        let password = password.to_string();
        let cost = self.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| crate::errors::AppError::Internal(anyhow::anyhow!("join: {}", e)))?
            .map_err(|e| crate::errors::AppError::Internal(anyhow::anyhow!("bcrypt: {}", e)))
    }

    /// Verify a password against a stored hash (password-change flow).
    pub async fn verify_password(&self, password: &str, hash: &str) -> bool {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash).unwrap_or(false))
            .await
            .unwrap_or(false)
    }
}

// ── Tests ──────────────────────────────────────────────────────

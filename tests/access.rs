//! Integration tests for the access-control stack: path-verb policy,
//! resource RBAC semantics (admin sentinel vs empty set), and the
//! failed-login lockout window.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use gateway::auth::local::LockoutTracker;
use gateway::auth::policy::PolicyEngine;
use gateway::auth::rbac::{filter_by_set, namespaces_at_level};
use gateway::models::namespace::{AccessLevel, NamespaceGrant};

fn roles(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ── Path-verb policy ───────────────────────────────────────────

#[test]
fn test_policy_chain_end_to_end() {
    let engine = PolicyEngine::with_defaults();

    // user: proxy yes, management no
    let user = roles(&["user"]);
    assert!(engine.allows(&user, "/api/v1/gateway/b1/tools/call", "POST"));
    assert!(!engine.allows(&user, "/api/v1/servers", "POST"));
    assert!(!engine.allows(&user, "/api/v1/audit/logs", "GET"));

    // viewer accrues user's grants
    let viewer = roles(&["viewer"]);
    assert!(engine.allows(&viewer, "/api/v1/gateway/b1", "POST"));
    assert!(engine.allows(&viewer, "/api/v1/audit/logs", "GET"));
    assert!(!engine.allows(&viewer, "/api/v1/servers/b1", "DELETE"));

    // operator accrues viewer's
    let operator = roles(&["operator"]);
    assert!(engine.allows(&operator, "/api/v1/servers/b1", "DELETE"));
    assert!(engine.allows(&operator, "/api/v1/audit/logs", "GET"));
    assert!(!engine.allows(&operator, "/api/v1/users", "GET"));

    // admin: everything
    let admin = roles(&["admin"]);
    assert!(engine.allows(&admin, "/api/v1/users", "GET"));
    assert!(engine.allows(&admin, "/api/v1/servers/b1/toggle", "PATCH"));
}

#[test]
fn test_policy_default_deny_for_unknown_route() {
    let engine = PolicyEngine::with_defaults();
    assert!(!engine.allows(&roles(&["operator"]), "/api/v2/servers", "GET"));
    assert!(!engine.allows(&roles(&["custom-role"]), "/api/v1/servers", "GET"));
}

// ── Resource RBAC ──────────────────────────────────────────────

fn grant(role: &str, ns: Uuid, level: AccessLevel) -> NamespaceGrant {
    NamespaceGrant {
        role_name: role.to_string(),
        namespace_id: ns,
        level,
    }
}

/// A viewer granted view on namespace A sees A's backend in listings but
/// cannot execute against it; upgrading the grant to execute unlocks the
/// call.
#[test]
fn test_viewer_view_grant_lists_but_does_not_execute() {
    let ns_a = Uuid::new_v4();
    let backend_in_a = Uuid::new_v4();
    let backend_elsewhere = Uuid::new_v4();

    let grants = vec![grant("viewer", ns_a, AccessLevel::View)];

    // View set contains ns A → listing shows its backend only.
    let view_namespaces = namespaces_at_level(&grants, AccessLevel::View);
    assert!(view_namespaces.contains(&ns_a));

    let view_set: Option<HashSet<Uuid>> = Some([backend_in_a].into_iter().collect());
    let listed = filter_by_set(
        vec![backend_in_a, backend_elsewhere],
        &view_set,
        |id| *id,
    );
    assert_eq!(listed, vec![backend_in_a]);

    // Execute set is empty → the proxy gate denies.
    assert!(namespaces_at_level(&grants, AccessLevel::Execute).is_empty());

    // Upgrade to execute → the same namespace satisfies both levels.
    let upgraded = vec![grant("viewer", ns_a, AccessLevel::Execute)];
    assert!(namespaces_at_level(&upgraded, AccessLevel::Execute).contains(&ns_a));
    assert!(namespaces_at_level(&upgraded, AccessLevel::View).contains(&ns_a));
}

#[test]
fn test_admin_sentinel_is_not_an_empty_set() {
    // The sentinel (None) must pass everything; an empty set must pass
    // nothing. Collapsing them turns "all backends" into "no backends".
    let backends = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

    let unfiltered = filter_by_set(backends.clone(), &None, |id| *id);
    assert_eq!(unfiltered.len(), 3);

    let none_accessible = filter_by_set(backends, &Some(HashSet::new()), |id| *id);
    assert!(none_accessible.is_empty());
}

#[test]
fn test_union_across_multiple_roles() {
    let ns_payments = Uuid::new_v4();
    let ns_search = Uuid::new_v4();
    let grants = vec![
        grant("payments-team", ns_payments, AccessLevel::Execute),
        grant("search-readers", ns_search, AccessLevel::View),
    ];

    let view = namespaces_at_level(&grants, AccessLevel::View);
    assert_eq!(view.len(), 2);

    let execute = namespaces_at_level(&grants, AccessLevel::Execute);
    assert_eq!(execute.len(), 1);
    assert!(execute.contains(&ns_payments));
}

// ── Lockout ────────────────────────────────────────────────────

#[test]
fn test_lockout_after_five_failures_within_window() {
    let tracker = LockoutTracker::new(5, Duration::from_secs(900), Duration::from_secs(900));

    for _ in 0..4 {
        tracker.record_failure("user@x");
        assert!(!tracker.is_locked("user@x"));
    }
    // Fifth failure trips the lock; the sixth attempt short-circuits before
    // any hashing work.
    assert!(tracker.record_failure("user@x"));
    assert!(tracker.is_locked("user@x"));
}

#[test]
fn test_lockout_clears_on_success() {
    let tracker = LockoutTracker::new(5, Duration::from_secs(900), Duration::from_secs(900));
    for _ in 0..4 {
        tracker.record_failure("user@x");
    }
    tracker.clear("user@x");
    assert!(!tracker.is_locked("user@x"));
    // The counter restarted from zero.
    for _ in 0..4 {
        assert!(!tracker.record_failure("user@x"));
    }
}

#[test]
fn test_expired_lock_allows_fresh_attempts() {
    let tracker = LockoutTracker::new(2, Duration::from_secs(900), Duration::from_millis(10));
    tracker.record_failure("user@x");
    assert!(tracker.record_failure("user@x"));
    std::thread::sleep(Duration::from_millis(20));
    assert!(!tracker.is_locked("user@x"));
}

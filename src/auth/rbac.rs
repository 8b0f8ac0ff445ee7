//! Resource RBAC — which backends can a principal see or call.
//!
//! Backends belong to namespaces; (role, namespace) pairs carry an access
//! level. A principal's effective set at level L is the union over its roles
//! of backends in namespaces granted ≥ L. The return type distinguishes the
//! admin/disabled sentinel (`None`, no filter) from an empty set (`Some`
//! with nothing — access to none); collapsing the two is the classic bug.

use std::collections::HashSet;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::namespace::{AccessLevel, NamespaceGrant};
use crate::models::principal::Principal;
use crate::store::postgres::PgStore;

pub struct RbacEngine {
    /// Global flag; off restores legacy "all see all" semantics.
    pub enabled: bool,
}

impl RbacEngine {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `None` means "no filter" — admin, or RBAC globally disabled.
    /// `Some(set)` is the effective accessible set, possibly empty.
    pub async fn accessible_backends(
        &self,
        store: &PgStore,
        principal: &Principal,
        level: AccessLevel,
    ) -> Result<Option<HashSet<Uuid>>, AppError> {
        if !self.enabled || principal.is_admin() {
            return Ok(None);
        }

        let grants = store.list_role_grants(&principal.roles).await?;
        let namespace_ids = namespaces_at_level(&grants, level);
        if namespace_ids.is_empty() {
            return Ok(Some(HashSet::new()));
        }

        let ids: Vec<Uuid> = namespace_ids.into_iter().collect();
        let backends = store.backends_in_namespaces(&ids).await?;
        Ok(Some(backends.into_iter().collect()))
    }

    /// Execute-level gate for the proxy path. The caller masks a deny as 404.
    pub async fn can_execute(
        &self,
        store: &PgStore,
        principal: &Principal,
        backend_id: Uuid,
    ) -> Result<bool, AppError> {
        match self
            .accessible_backends(store, principal, AccessLevel::Execute)
            .await?
        {
            None => Ok(true),
            Some(set) => Ok(set.contains(&backend_id)),
        }
    }
}

/// Namespaces granted at `level` or stronger. Execute grants satisfy a view
/// query; view grants never satisfy an execute query.
pub fn namespaces_at_level(grants: &[NamespaceGrant], level: AccessLevel) -> HashSet<Uuid> {
    grants
        .iter()
        .filter(|g| g.level >= level)
        .map(|g| g.namespace_id)
        .collect()
}

/// Apply an effective set to a listing. `None` passes everything through.
pub fn filter_by_set<T, F>(items: Vec<T>, set: &Option<HashSet<Uuid>>, id_of: F) -> Vec<T>
where
    F: Fn(&T) -> Uuid,
{
    match set {
        None => items,
        Some(allowed) => items
            .into_iter()
            .filter(|item| allowed.contains(&id_of(item)))
            .collect(),
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(ns: Uuid, level: AccessLevel) -> NamespaceGrant {
        NamespaceGrant {
            role_name: "viewer".into(),
            namespace_id: ns,
            level,
        }
    }

    #[test]
    fn test_execute_implies_view() {
        let ns = Uuid::new_v4();
        let grants = vec![grant(ns, AccessLevel::Execute)];
        assert!(namespaces_at_level(&grants, AccessLevel::View).contains(&ns));
        assert!(namespaces_at_level(&grants, AccessLevel::Execute).contains(&ns));
    }

    #[test]
    fn test_view_does_not_imply_execute() {
        let ns = Uuid::new_v4();
        let grants = vec![grant(ns, AccessLevel::View)];
        assert!(namespaces_at_level(&grants, AccessLevel::View).contains(&ns));
        assert!(namespaces_at_level(&grants, AccessLevel::Execute).is_empty());
    }

    #[test]
    fn test_union_across_grants() {
        let ns1 = Uuid::new_v4();
        let ns2 = Uuid::new_v4();
        let grants = vec![grant(ns1, AccessLevel::View), grant(ns2, AccessLevel::Execute)];
        let view = namespaces_at_level(&grants, AccessLevel::View);
        assert_eq!(view.len(), 2);
        let exec = namespaces_at_level(&grants, AccessLevel::Execute);
        assert_eq!(exec.len(), 1);
        assert!(exec.contains(&ns2));
    }

    #[test]
    fn test_filter_none_is_no_filter() {
        // Sentinel: admin / rbac-disabled must see the full listing, not an
        // empty one.
        let items = vec![Uuid::new_v4(), Uuid::new_v4()];
        let filtered = filter_by_set(items.clone(), &None, |id| *id);
        assert_eq!(filtered, items);
    }

    #[test]
    fn test_filter_empty_set_hides_everything() {
        // Some(empty) means access to none — distinct from the sentinel.
        let items = vec![Uuid::new_v4(), Uuid::new_v4()];
        let filtered = filter_by_set(items, &Some(HashSet::new()), |id| *id);
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_filter_some_keeps_members_only() {
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        let mut set = HashSet::new();
        set.insert(keep);
        let filtered = filter_by_set(vec![keep, drop], &Some(set), |id| *id);
        assert_eq!(filtered, vec![keep]);
    }
}

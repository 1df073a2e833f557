//! Scope derivation — the declarative mapping from provider groups to
//! token scopes.
//!
//! The mapping is configured as `scope -> [group, ...]`; a scope is
//! granted when the user belongs to at least one of its groups. Two
//! synthetic scopes overlay the mapping: every authenticated session
//! carries `user:token`, and users in the admin table additionally carry
//! `admin:token`. Derivation is a pure function of its inputs.

use std::collections::{BTreeSet, HashMap};

use crate::config::{ADMIN_TOKEN_SCOPE, USER_TOKEN_SCOPE};
use crate::models::TokenGroup;

/// Derive the mapped scopes for a set of group memberships.
///
/// Output ordering is sorted; group order is irrelevant.
#[must_use]
pub fn scopes_from_groups(
    groups: &[TokenGroup],
    mapping: &HashMap<String, Vec<String>>,
) -> BTreeSet<String> {
    let mut scopes = BTreeSet::new();
    for (scope, granting) in mapping {
        if granting.iter().any(|g| groups.iter().any(|m| &m.name == g)) {
            scopes.insert(scope.clone());
        }
    }
    scopes
}

/// The full scope set for a new session token.
///
/// Applies the group mapping plus the synthetic `user:token` and (for
/// admins) `admin:token` overlays, returning a sorted list.
#[must_use]
pub fn session_scopes(
    groups: &[TokenGroup],
    mapping: &HashMap<String, Vec<String>>,
    is_admin: bool,
) -> Vec<String> {
    let mut scopes = scopes_from_groups(groups, mapping);
    scopes.insert(USER_TOKEN_SCOPE.to_string());
    if is_admin {
        scopes.insert(ADMIN_TOKEN_SCOPE.to_string());
    }
    scopes.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> TokenGroup {
        TokenGroup {
            name: name.to_string(),
            id: None,
        }
    }

    fn mapping() -> HashMap<String, Vec<String>> {
        HashMap::from([
            (
                "exec:admin".to_string(),
                vec!["lsst-sqre-square".to_string()],
            ),
            (
                "read:all".to_string(),
                vec!["staff".to_string(), "lsst-sqre-square".to_string()],
            ),
            ("write:all".to_string(), vec!["ops".to_string()]),
        ])
    }

    #[test]
    fn scopes_follow_group_intersection() {
        // GIVEN: membership in one mapped group
        let groups = vec![group("lsst-sqre-square")];

        // WHEN: scopes are derived
        let scopes = scopes_from_groups(&groups, &mapping());

        // THEN: every scope granted by that group appears, others do not
        assert!(scopes.contains("exec:admin"));
        assert!(scopes.contains("read:all"));
        assert!(!scopes.contains("write:all"));
    }

    #[test]
    fn no_groups_yields_no_mapped_scopes() {
        let scopes = scopes_from_groups(&[], &mapping());
        assert!(scopes.is_empty());
    }

    #[test]
    fn derivation_is_deterministic() {
        // Same inputs in any order produce the same scope set.
        let forward = vec![group("staff"), group("ops")];
        let reverse = vec![group("ops"), group("staff")];
        assert_eq!(
            scopes_from_groups(&forward, &mapping()),
            scopes_from_groups(&reverse, &mapping())
        );
    }

    #[test]
    fn session_scopes_always_include_user_token() {
        let scopes = session_scopes(&[], &mapping(), false);
        assert_eq!(scopes, vec!["user:token"]);
    }

    #[test]
    fn session_scopes_add_admin_token_for_admins() {
        // GIVEN: an admin with one mapped group
        let groups = vec![group("lsst-sqre-square")];

        // WHEN: session scopes are derived
        let scopes = session_scopes(&groups, &mapping(), true);

        // THEN: synthetic scopes overlay the mapped ones, sorted
        assert_eq!(
            scopes,
            vec!["admin:token", "exec:admin", "read:all", "user:token"]
        );
    }
}

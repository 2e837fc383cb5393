//! Decides whether a principal may change a collection's image retention.
//!
//! Rules are evaluated in a fixed order and the first match wins, so the
//! reason for a grant is always reproducible from the snapshot:
//!
//! 1. an inherited privilege grants `collMod` or `anyAction`
//! 2. an explicit privilege grants `collMod` or `anyAction`
//! 3. an explicit role is on the administrative allow-list
//! 4. an inherited role is on the administrative allow-list

use changewatch_core::{PrincipalProfile, Privilege, RoleRef};

/// Actions that allow changing collection options.
pub const ELEVATING_ACTIONS: &[&str] = &["collMod", "anyAction"];

/// Roles that allow changing collection options.
pub const ADMIN_ROLES: &[&str] = &[
    "dbAdmin",
    "dbOwner",
    "root",
    "atlasAdmin",
    "dbAdminAnyDatabase",
];

/// Which rule granted elevation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationGrant {
    /// An inherited privilege grants the named action.
    InheritedPrivilege {
        /// The matching action.
        action: String,
    },
    /// An explicit privilege grants the named action.
    ExplicitPrivilege {
        /// The matching action.
        action: String,
    },
    /// An explicit role is on the allow-list.
    ExplicitRole {
        /// The matching role.
        role: String,
    },
    /// An inherited role is on the allow-list.
    InheritedRole {
        /// The matching role.
        role: String,
    },
}

/// Pure permission check over a [`PrincipalProfile`] snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionResolver;

impl PermissionResolver {
    /// Create a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Whether `profile` may elevate. An absent profile never may.
    #[must_use]
    pub fn can_elevate(&self, profile: Option<&PrincipalProfile>) -> bool {
        self.evaluate(profile).is_some()
    }

    /// The first rule that grants elevation, if any.
    #[must_use]
    pub fn evaluate(&self, profile: Option<&PrincipalProfile>) -> Option<ElevationGrant> {
        let profile = profile?;

        if let Some(action) = elevating_action(&profile.inherited_privileges) {
            return Some(ElevationGrant::InheritedPrivilege { action });
        }
        if let Some(action) = elevating_action(&profile.privileges) {
            return Some(ElevationGrant::ExplicitPrivilege { action });
        }
        if let Some(role) = admin_role(&profile.roles) {
            return Some(ElevationGrant::ExplicitRole { role });
        }
        if let Some(role) = admin_role(&profile.inherited_roles) {
            return Some(ElevationGrant::InheritedRole { role });
        }
        None
    }
}

fn elevating_action(privileges: &[Privilege]) -> Option<String> {
    privileges
        .iter()
        .flat_map(|p| p.actions.iter())
        .find(|action| ELEVATING_ACTIONS.contains(&action.as_str()))
        .cloned()
}

fn admin_role(roles: &[RoleRef]) -> Option<String> {
    roles
        .iter()
        .find(|r| ADMIN_ROLES.contains(&r.role.as_str()))
        .map(|r| r.role.clone())
}

//! Principal identity and privilege snapshots.
//!
//! The field names follow the user registry's `usersInfo` output so a
//! registry entry deserializes directly into a [`PrincipalProfile`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An authenticated identity: user name plus the database it authenticates against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// User name.
    pub user: String,
    /// Authentication database.
    pub db: String,
}

impl Principal {
    /// Create a principal.
    #[must_use]
    pub fn new(user: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            db: db.into(),
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.db)
    }
}

/// A role held by a principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    /// Role name.
    pub role: String,
    /// Database the role is defined on.
    pub db: String,
}

impl RoleRef {
    /// Create a role reference.
    #[must_use]
    pub fn new(role: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            db: db.into(),
        }
    }
}

/// A resource/action grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Privilege {
    /// The resource the actions apply to (database, collection, cluster, ...).
    pub resource: Value,
    /// Actions granted on the resource.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Privilege {
    /// Create a privilege over `resource` granting `actions`.
    #[must_use]
    pub fn new<I, S>(resource: Value, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource,
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this privilege grants `action`.
    #[must_use]
    pub fn grants(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

/// Read-only snapshot of a principal's roles and privileges.
///
/// Fetched fresh for every provisioning attempt and never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalProfile {
    /// User name.
    pub user: String,
    /// Authentication database.
    pub db: String,
    /// Roles granted directly.
    #[serde(default)]
    pub roles: Vec<RoleRef>,
    /// Roles reachable through role inheritance.
    #[serde(default)]
    pub inherited_roles: Vec<RoleRef>,
    /// Privileges granted directly.
    #[serde(default)]
    pub privileges: Vec<Privilege>,
    /// Privileges reachable through role inheritance.
    #[serde(default)]
    pub inherited_privileges: Vec<Privilege>,
}

impl PrincipalProfile {
    /// Create an empty profile for `principal`.
    #[must_use]
    pub fn new(principal: &Principal) -> Self {
        Self {
            user: principal.user.clone(),
            db: principal.db.clone(),
            roles: Vec::new(),
            inherited_roles: Vec::new(),
            privileges: Vec::new(),
            inherited_privileges: Vec::new(),
        }
    }

    /// The identity this profile describes.
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal::new(self.user.clone(), self.db.clone())
    }

    /// Add a directly granted role.
    #[must_use]
    pub fn with_role(mut self, role: RoleRef) -> Self {
        self.roles.push(role);
        self
    }

    /// Add an inherited role.
    #[must_use]
    pub fn with_inherited_role(mut self, role: RoleRef) -> Self {
        self.inherited_roles.push(role);
        self
    }

    /// Add a directly granted privilege.
    #[must_use]
    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privileges.push(privilege);
        self
    }

    /// Add an inherited privilege.
    #[must_use]
    pub fn with_inherited_privilege(mut self, privilege: Privilege) -> Self {
        self.inherited_privileges.push(privilege);
        self
    }
}

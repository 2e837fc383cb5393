//! Enables before/after image retention per collection when permitted.
//!
//! Provisioning never fails initialization. Every outcome other than
//! [`ProvisionOutcome::Enabled`] is a degraded capability: the collection
//! is still audited, but its records may lack before-images.

use std::fmt;
use std::sync::Arc;

use changewatch_core::{Document, Principal, PrincipalProfile};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::permission::PermissionResolver;

/// Result of one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Image retention is enabled on the collection.
    Enabled,
    /// No authenticated principal, or it is unknown to the user registry.
    SkippedNoPrincipal,
    /// The principal lacks permission to change collection options.
    SkippedNoPermission,
    /// The storage command failed.
    FailedAtStorage(String),
}

impl ProvisionOutcome {
    /// Whether image retention was enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl fmt::Display for ProvisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::SkippedNoPrincipal => write!(f, "skipped: no authenticated principal"),
            Self::SkippedNoPermission => write!(f, "skipped: insufficient permission"),
            Self::FailedAtStorage(reason) => write!(f, "failed at storage: {reason}"),
        }
    }
}

/// Attempts to enable image retention on audited collections.
pub struct PreImageProvisioner {
    connection: Arc<dyn Connection>,
    resolver: PermissionResolver,
}

impl PreImageProvisioner {
    /// Create a provisioner over `connection`.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            resolver: PermissionResolver::new(),
        }
    }

    /// Provision image retention for `collection`.
    ///
    /// The principal's profile is fetched fresh on every call.
    pub async fn provision(&self, collection: &str) -> ProvisionOutcome {
        let outcome = self.attempt(collection).await;
        match &outcome {
            ProvisionOutcome::Enabled => {
                info!(collection, "Image retention enabled");
            },
            degraded => {
                warn!(
                    collection,
                    outcome = %degraded,
                    "Image retention not enabled; before-images may be missing"
                );
            },
        }
        outcome
    }

    async fn attempt(&self, collection: &str) -> ProvisionOutcome {
        let Some(principal) = self.current_principal().await else {
            return ProvisionOutcome::SkippedNoPrincipal;
        };
        let Some(profile) = self.fetch_profile(&principal).await else {
            return ProvisionOutcome::SkippedNoPrincipal;
        };

        match self.resolver.evaluate(Some(&profile)) {
            Some(grant) => {
                debug!(collection, principal = %principal, ?grant, "Elevation granted");
            },
            None => return ProvisionOutcome::SkippedNoPermission,
        }

        self.enable_images(collection).await
    }

    async fn current_principal(&self) -> Option<Principal> {
        let request = command(json!({ "connectionStatus": 1 }));
        let reply = match self.connection.run_command(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "connectionStatus failed");
                return None;
            },
        };
        let user = reply
            .get("authInfo")?
            .get("authenticatedUsers")?
            .as_array()?
            .first()?
            .clone();
        serde_json::from_value(user).ok()
    }

    async fn fetch_profile(&self, principal: &Principal) -> Option<PrincipalProfile> {
        let request = command(json!({
            "usersInfo": { "user": principal.user, "db": principal.db },
            "showPrivileges": true,
        }));
        let reply = match self.connection.run_command(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(principal = %principal, error = %e, "usersInfo failed");
                return None;
            },
        };
        let user = reply.get("users")?.as_array()?.first()?.clone();
        match serde_json::from_value(user) {
            Ok(profile) => Some(profile),
            Err(e) => {
                debug!(principal = %principal, error = %e, "Malformed usersInfo entry");
                None
            },
        }
    }

    async fn enable_images(&self, collection: &str) -> ProvisionOutcome {
        let request = command(json!({
            "collMod": collection,
            "changeStreamPreAndPostImages": { "enabled": true },
        }));
        match self.connection.run_command(request).await {
            Ok(reply) if reply_ok(&reply) => ProvisionOutcome::Enabled,
            Ok(reply) => {
                let reason = reply
                    .get("errmsg")
                    .and_then(Value::as_str)
                    .unwrap_or("command returned ok: 0")
                    .to_owned();
                ProvisionOutcome::FailedAtStorage(reason)
            },
            Err(e) => ProvisionOutcome::FailedAtStorage(e.to_string()),
        }
    }
}

impl fmt::Debug for PreImageProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreImageProvisioner").finish_non_exhaustive()
    }
}

fn command(value: Value) -> Document {
    match value {
        Value::Object(doc) => doc,
        _ => Document::new(),
    }
}

/// Servers report `ok` as an integer or a double.
fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Value::Bool(ok)) => *ok,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v >= 1.0),
        _ => false,
    }
}

//! Role references and cross-project replication
//!
//! Project-bound custom roles are not valid grantees outside the project
//! that defines them; the binding API rejects a cross-project reference.
//! Before binding into a target project, a structurally identical replica
//! of each project-bound role must exist there. Organization-wide and
//! predefined roles are usable everywhere and are passed through untouched.

use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::provider::{CloudProvider, ErrorKind, ProviderError, RoleDefinition};
use crate::provision;
use crate::retry::RetryPolicy;
use crate::scopes::ScopeSet;

/// A parsed role reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoleRef {
    /// `projects/{project_id}/roles/{role_id}` — valid only in its origin
    /// project.
    Project { project_id: String, role_id: String },
    /// `organizations/{org_id}/roles/{role_id}` — usable in any scope under
    /// the organization.
    Organization { org_id: String, role_id: String },
    /// `roles/{role_id}` — a predefined role, usable everywhere.
    Predefined(String),
}

impl RoleRef {
    pub fn parse(reference: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = reference.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "roles", role] if !project.is_empty() && !role.is_empty() => {
                Ok(RoleRef::Project {
                    project_id: (*project).to_string(),
                    role_id: (*role).to_string(),
                })
            }
            ["organizations", org, "roles", role] if !org.is_empty() && !role.is_empty() => {
                Ok(RoleRef::Organization {
                    org_id: (*org).to_string(),
                    role_id: (*role).to_string(),
                })
            }
            ["roles", role] if !role.is_empty() => Ok(RoleRef::Predefined((*reference).to_string())),
            _ => Err(ConfigError::InvalidRoleRef(reference.to_string())),
        }
    }

    /// Whether this role is valid only inside its origin project.
    pub fn is_scope_bound(&self) -> bool {
        matches!(self, RoleRef::Project { .. })
    }

    pub fn role_id(&self) -> &str {
        match self {
            RoleRef::Project { role_id, .. } | RoleRef::Organization { role_id, .. } => role_id,
            RoleRef::Predefined(name) => name.rsplit('/').next().unwrap_or(name),
        }
    }

    pub fn origin_project(&self) -> Option<&str> {
        match self {
            RoleRef::Project { project_id, .. } => Some(project_id),
            _ => None,
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleRef::Project { project_id, role_id } => {
                write!(f, "projects/{}/roles/{}", project_id, role_id)
            }
            RoleRef::Organization { org_id, role_id } => {
                write!(f, "organizations/{}/roles/{}", org_id, role_id)
            }
            RoleRef::Predefined(name) => f.write_str(name),
        }
    }
}

/// Per-scope mapping from an origin role reference to its local replica.
///
/// A missing entry for a (scope, role) pair means the role has not been
/// replicated there yet; bindings for that pair fall back to the raw
/// reference, which the provider is expected to reject.
#[derive(Debug, Clone, Default)]
pub struct ReplicationMap {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl ReplicationMap {
    pub fn record(
        &mut self,
        scope: impl Into<String>,
        origin: impl Into<String>,
        replica: impl Into<String>,
    ) {
        self.entries
            .entry(scope.into())
            .or_default()
            .insert(origin.into(), replica.into());
    }

    pub fn lookup(&self, scope: &str, origin: &str) -> Option<&str> {
        self.entries
            .get(scope)
            .and_then(|m| m.get(origin))
            .map(String::as_str)
    }

    /// The authoritative reference for `role` when binding in `scope`.
    ///
    /// Organization-wide and predefined roles, and project-bound roles bound
    /// in their origin project, resolve to themselves. Everything else
    /// resolves through the map, falling back to the raw reference when
    /// unreplicated.
    pub fn resolve(&self, scope: &str, role: &RoleRef) -> String {
        match role {
            RoleRef::Project { project_id, .. } if project_id != scope => {
                let origin = role.to_string();
                match self.lookup(scope, &origin) {
                    Some(replica) => replica.to_string(),
                    None => origin,
                }
            }
            _ => role.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild replica membership from live provider state.
    ///
    /// The persisted record does not carry the map; it is re-derived by
    /// probing each scope for a role with the origin's short id.
    pub async fn rebuild<P: CloudProvider>(
        provider: &P,
        roles: &[RoleRef],
        scopes: &[String],
    ) -> Self {
        let mut map = Self::default();
        for scope in scopes {
            for role in roles {
                let RoleRef::Project { project_id, role_id } = role else {
                    continue;
                };
                if project_id == scope {
                    continue;
                }
                let replica = format!("projects/{}/roles/{}", scope, role_id);
                match provider.get_role(&replica).await {
                    Ok(_) => map.record(scope.clone(), role.to_string(), replica),
                    Err(err) if err.is(ErrorKind::NotFound) => {}
                    Err(err) => {
                        warn!(
                            scope = %scope,
                            role = %replica,
                            error = %err,
                            "could not probe for role replica"
                        );
                    }
                }
            }
        }
        map
    }
}

/// Copies project-bound role definitions into target scopes.
pub struct RoleReplicator<'a, P: CloudProvider> {
    provider: &'a P,
    retry: &'a RetryPolicy,
}

impl<'a, P: CloudProvider> RoleReplicator<'a, P> {
    pub fn new(provider: &'a P, retry: &'a RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Ensure a usable reference for `role` exists in `target_scope`,
    /// recording any replica in `map`. Returns the scope-correct reference.
    pub async fn ensure_replica(
        &self,
        role: &RoleRef,
        target_scope: &str,
        map: &mut ReplicationMap,
    ) -> Result<String, ProviderError> {
        let RoleRef::Project { project_id: origin_project, role_id } = role else {
            return Ok(role.to_string());
        };
        if origin_project == target_scope {
            return Ok(role.to_string());
        }

        let origin = role.to_string();
        let replica_name = format!("projects/{}/roles/{}", target_scope, role_id);

        if map.lookup(target_scope, &origin).is_some() {
            return Ok(replica_name);
        }

        // The origin definition is always fetched so an existing replica is
        // reconciled against it instead of adopted as-is.
        let source = crate::retry::with_retry("get origin role", self.retry, || {
            self.provider.get_role(&origin)
        })
        .await?;

        let definition = RoleDefinition {
            name: replica_name.clone(),
            title: source.title.clone(),
            description: format!("{} (replicated from {})", source.description, origin),
            included_permissions: source.included_permissions.clone(),
            stage: source.stage.clone(),
        };

        let provisioned =
            provision::ensure_role(self.provider, self.retry, target_scope, role_id, &definition)
                .await?;
        if provisioned.adopted {
            debug!(role = %replica_name, "adopted and reconciled existing replica");
        } else {
            info!(role = %replica_name, origin = %origin, "replicated role");
        }

        map.record(target_scope, origin, replica_name.clone());
        Ok(replica_name)
    }

    /// Replicate every project-bound role into every target scope.
    ///
    /// Best effort: a failure for one (role, scope) pair is logged and
    /// skipped so remaining scopes still get their replicas. The skipped
    /// pair stays absent from `map`, which later keeps the scope out of the
    /// bound set.
    pub async fn replicate_all(
        &self,
        roles: &[RoleRef],
        scopes: &ScopeSet,
        map: &mut ReplicationMap,
    ) {
        for scope in scopes.iter() {
            for role in roles {
                if let Err(err) = self.ensure_replica(role, &scope.project_id, map).await {
                    warn!(
                        scope = %scope.project_id,
                        role = %role,
                        error = %err,
                        "role replication failed, skipping this scope for the role"
                    );
                }
            }
        }
    }
}

//! Binding reconciliation per target scope
//!
//! Bindings are never stored: presence is derived from each scope's
//! access-policy document. `apply` adds the (member, role) grants, `verify`
//! re-derives presence on read to detect drift without mutating anything,
//! and `remove` tolerates grants that are already gone.

use tracing::{debug, warn};

use crate::provider::{CloudProvider, ErrorKind, ProviderError};
use crate::roles::{ReplicationMap, RoleRef};

pub struct BindingReconciler<'a, P: CloudProvider> {
    provider: &'a P,
}

impl<'a, P: CloudProvider> BindingReconciler<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    /// Grant `member` every role in `scope`, resolving scope-correct
    /// references through the replication map. Returns true only if every
    /// role was bound; failures are logged and do not abort the remaining
    /// roles.
    pub async fn apply(
        &self,
        scope: &str,
        member: &str,
        roles: &[RoleRef],
        map: &ReplicationMap,
    ) -> bool {
        let mut all_bound = true;
        for role in roles {
            let resolved = map.resolve(scope, role);
            match self.provider.add_binding(scope, &resolved, member).await {
                Ok(()) => debug!(scope = %scope, role = %resolved, "binding ensured"),
                Err(err) if err.is(ErrorKind::AlreadyExists) => {
                    debug!(scope = %scope, role = %resolved, "binding already present")
                }
                Err(err) => {
                    warn!(
                        scope = %scope,
                        role = %resolved,
                        error = %err,
                        "failed to add binding"
                    );
                    all_bound = false;
                }
            }
        }
        all_bound
    }

    /// Check that every required (role, member) pair is present in the
    /// scope's policy. Fetches the policy document once and never mutates
    /// it; returns false on the first gap.
    pub async fn verify(
        &self,
        scope: &str,
        member: &str,
        roles: &[RoleRef],
        map: &ReplicationMap,
    ) -> Result<bool, ProviderError> {
        let policy = self.provider.get_iam_policy(scope).await?;
        for role in roles {
            let resolved = map.resolve(scope, role);
            if !policy.has_member(&resolved, member) {
                debug!(scope = %scope, role = %resolved, "binding missing (drift)");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove `member`'s grants in `scope`. A grant that is already absent
    /// counts as removed.
    pub async fn remove(
        &self,
        scope: &str,
        member: &str,
        roles: &[RoleRef],
        map: &ReplicationMap,
    ) -> bool {
        let mut all_removed = true;
        for role in roles {
            let resolved = map.resolve(scope, role);
            match self.provider.remove_binding(scope, &resolved, member).await {
                Ok(()) => debug!(scope = %scope, role = %resolved, "binding removed"),
                Err(err) if err.is(ErrorKind::NotFound) => {
                    debug!(scope = %scope, role = %resolved, "binding already absent")
                }
                Err(err) => {
                    warn!(
                        scope = %scope,
                        role = %resolved,
                        error = %err,
                        "failed to remove binding"
                    );
                    all_removed = false;
                }
            }
        }
        all_removed
    }
}

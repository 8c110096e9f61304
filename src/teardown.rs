//! Best-effort, idempotent teardown
//!
//! Removal order: bindings, then replicated roles (never the origin), then
//! the key, then the identity. Each step is independently best-effort: a
//! failure in one scope or step is recorded and the remaining steps still
//! run. "Already absent" is success everywhere, which makes a second
//! teardown over deleted resources a no-op.

use tracing::{debug, info, warn};

use crate::bindings::BindingReconciler;
use crate::provider::{CloudProvider, ErrorKind};
use crate::roles::{ReplicationMap, RoleRef};
use crate::scopes::ScopeSet;

/// What teardown managed to remove; failures are warnings, never errors.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub scopes_processed: usize,
    pub key_deleted: bool,
    pub identity_deleted: bool,
    pub warnings: Vec<String>,
}

pub struct TeardownCoordinator<'a, P: CloudProvider> {
    provider: &'a P,
}

impl<'a, P: CloudProvider> TeardownCoordinator<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    pub async fn teardown(
        &self,
        email: &str,
        member: &str,
        roles: &[RoleRef],
        scopes: &ScopeSet,
        map: &ReplicationMap,
        key_name: Option<&str>,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        let reconciler = BindingReconciler::new(self.provider);

        // 1. Bindings, every scope independently.
        for scope in scopes.iter() {
            report.scopes_processed += 1;
            if !reconciler
                .remove(&scope.project_id, member, roles, map)
                .await
            {
                report.warnings.push(format!(
                    "some bindings in {} could not be removed",
                    scope.project_id
                ));
            }
        }

        // 2. Replicated roles; the origin definition is never touched.
        for scope in scopes.iter() {
            for role in roles {
                let RoleRef::Project { project_id, role_id } = role else {
                    continue;
                };
                if project_id == &scope.project_id {
                    continue;
                }
                let replica = format!("projects/{}/roles/{}", scope.project_id, role_id);
                match self.provider.delete_role(&replica).await {
                    Ok(()) => info!(role = %replica, "deleted replicated role"),
                    Err(err) if err.is(ErrorKind::NotFound) => {
                        debug!(role = %replica, "replica already absent")
                    }
                    Err(err) => {
                        warn!(role = %replica, error = %err, "failed to delete replica");
                        report
                            .warnings
                            .push(format!("replica {} not deleted: {}", replica, err));
                    }
                }
            }
        }

        // 3. The active key.
        match key_name {
            Some(name) => match self.provider.delete_service_account_key(name).await {
                Ok(()) => {
                    info!(key = %name, "deleted service account key");
                    report.key_deleted = true;
                }
                Err(err) if err.is(ErrorKind::NotFound) => {
                    debug!(key = %name, "key already absent");
                    report.key_deleted = true;
                }
                Err(err) => {
                    warn!(key = %name, error = %err, "failed to delete key");
                    report
                        .warnings
                        .push(format!("key {} not deleted: {}", name, err));
                }
            },
            None => report.key_deleted = true,
        }

        // 4. The identity. Upstream this starts a soft-delete retention
        // window; there is no waiting for the purge.
        match self.provider.delete_service_account(email).await {
            Ok(()) => {
                info!(email = %email, "deleted service identity");
                report.identity_deleted = true;
            }
            Err(err) if err.is(ErrorKind::NotFound) => {
                debug!(email = %email, "identity already absent");
                report.identity_deleted = true;
            }
            Err(err) => {
                warn!(email = %email, error = %err, "failed to delete identity");
                report
                    .warnings
                    .push(format!("identity {} not deleted: {}", email, err));
            }
        }

        report
    }
}

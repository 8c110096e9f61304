//! Reconciliation engine
//!
//! Drives one integration through its lifecycle: provision the identity,
//! replicate project-bound roles into every target scope, apply bindings,
//! ensure the credential, and on teardown unwind the same steps in reverse.
//! Each invocation is sequential; partial binding failures shrink the bound
//! set instead of failing the whole operation, and the next reconcile picks
//! the missing scopes back up.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use crate::bindings::BindingReconciler;
use crate::config::IntegrationSpec;
use crate::keys::{rotation_requested, CredentialRotator};
use crate::provider::{CloudProvider, ErrorKind};
use crate::provision;
use crate::record::{IntegrationRecord, Phase};
use crate::retry::{with_retry, RetryPolicy};
use crate::roles::{ReplicationMap, RoleRef};
use crate::scopes::{ScopeResolver, ScopeSet};
use crate::teardown::{TeardownCoordinator, TeardownReport};

/// Wait after creating the identity before issuing dependent writes.
/// Freshly created identities are not immediately visible to the policy
/// backend.
const DEFAULT_PROPAGATION_WAIT: Duration = Duration::from_secs(30);

pub struct IntegrationEngine<P: CloudProvider> {
    provider: P,
    retry: RetryPolicy,
    propagation_wait: Duration,
}

impl<P: CloudProvider> IntegrationEngine<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            propagation_wait: DEFAULT_PROPAGATION_WAIT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_propagation_wait(mut self, wait: Duration) -> Self {
        self.propagation_wait = wait;
        self
    }

    /// Provision the integration end to end and return its record.
    ///
    /// Idempotent: existing resources are adopted, existing bindings are
    /// kept.
    pub async fn create(&self, spec: &IntegrationSpec) -> Result<IntegrationRecord> {
        spec.validate().context("invalid integration spec")?;
        let roles = spec.parsed_roles()?;
        let mut record = IntegrationRecord::new(spec);

        let identity = provision::ensure_service_account(
            &self.provider,
            &self.retry,
            &spec.project_id,
            &spec.account_id,
            &spec.display_name,
            &spec.description,
        )
        .await
        .context("failed to provision service identity")?;
        record.unique_id = identity.handle.unique_id.clone();
        if !identity.adopted && !self.propagation_wait.is_zero() {
            tokio::time::sleep(self.propagation_wait).await;
        }
        record.transition(Phase::Replicating);

        let scopes = self.resolve_scopes(spec).await?;
        let map = self.replicate(&roles, &scopes).await;
        record.transition(Phase::Binding);

        let (bound, numbers) = self.apply_bindings(&record.member(), &roles, &scopes, &map).await;
        record.bound_projects = bound;
        record.bound_project_numbers = numbers;
        record.transition(Phase::Keyed);

        let rotator = CredentialRotator::new(&self.provider, &self.retry);
        let key = rotator
            .ensure(&record.email, None)
            .await
            .context("failed to ensure service account key")?;
        record.key = Some(key);
        record.transition(Phase::Active);
        record.touch();

        info!(
            email = %record.email,
            scopes = record.bound_projects.len(),
            "integration provisioned"
        );
        Ok(record)
    }

    /// Refresh observed state. Returns `None` when the identity no longer
    /// exists, signalling that the resource is gone; drifted scopes are
    /// dropped from the bound lists without being repaired.
    pub async fn read(&self, record: &IntegrationRecord) -> Result<Option<IntegrationRecord>> {
        let fetched = with_retry("get service account", &self.retry, || {
            self.provider.get_service_account(&record.email)
        })
        .await;
        let identity = match fetched {
            Ok(identity) => identity,
            Err(err) if err.is(ErrorKind::NotFound) => {
                info!(email = %record.email, "service identity no longer exists");
                return Ok(None);
            }
            Err(err) => return Err(err).context("failed to read service identity"),
        };

        let roles = record.parsed_roles()?;
        let map = ReplicationMap::rebuild(&self.provider, &roles, &record.bound_projects).await;
        let reconciler = BindingReconciler::new(&self.provider);
        let member = record.member();

        let mut refreshed = record.clone();
        refreshed.unique_id = identity.unique_id;
        refreshed.bound_projects = Vec::new();
        refreshed.bound_project_numbers = Vec::new();
        for (project, number) in record
            .bound_projects
            .iter()
            .zip(&record.bound_project_numbers)
        {
            match reconciler.verify(project, &member, &roles, &map).await {
                Ok(true) => {
                    refreshed.bound_projects.push(project.clone());
                    refreshed.bound_project_numbers.push(*number);
                }
                Ok(false) => {
                    warn!(scope = %project, "binding drift detected, scope dropped from bound set")
                }
                Err(err) => {
                    warn!(scope = %project, error = %err, "could not verify bindings");
                    // Unverifiable is not the same as drifted.
                    refreshed.bound_projects.push(project.clone());
                    refreshed.bound_project_numbers.push(*number);
                }
            }
        }
        refreshed.touch();
        Ok(Some(refreshed))
    }

    /// Reconcile the integration against a changed spec: re-resolve scopes,
    /// fan roles and bindings out to new members, withdraw grants that no
    /// longer apply, and rotate the key if the rotation token changed.
    pub async fn update(
        &self,
        record: &IntegrationRecord,
        spec: &IntegrationSpec,
    ) -> Result<IntegrationRecord> {
        spec.validate().context("invalid integration spec")?;
        // The natural key is immutable; a changed one would mint a second
        // identity while the record keeps binding the old member.
        if spec.project_id != record.spec.project_id || spec.account_id != record.spec.account_id {
            anyhow::bail!(
                "project_id and account_id are immutable: record has {}/{}, spec has {}/{}",
                record.spec.project_id,
                record.spec.account_id,
                spec.project_id,
                spec.account_id
            );
        }
        let roles = spec.parsed_roles()?;
        let old_roles = record.parsed_roles()?;

        let mut updated = record.clone();
        let identity = provision::ensure_service_account(
            &self.provider,
            &self.retry,
            &spec.project_id,
            &spec.account_id,
            &spec.display_name,
            &spec.description,
        )
        .await
        .context("failed to reconcile service identity")?;
        updated.unique_id = identity.handle.unique_id.clone();
        updated.transition(Phase::Replicating);

        let scopes = self.resolve_scopes(spec).await?;
        let map = self.replicate(&roles, &scopes).await;
        updated.transition(Phase::Binding);

        let member = record.member();
        let (bound, numbers) = self.apply_bindings(&member, &roles, &scopes, &map).await;

        self.withdraw_stale_grants(&member, record, &old_roles, &roles, &scopes)
            .await;

        updated.bound_projects = bound;
        updated.bound_project_numbers = numbers;
        updated.transition(Phase::Keyed);

        let rotator = CredentialRotator::new(&self.provider, &self.retry);
        let key = if rotation_requested(
            record.spec.rotation_token.as_deref(),
            spec.rotation_token.as_deref(),
        ) {
            rotator
                .rotate(&record.email, record.key.as_ref())
                .await
                .context("failed to rotate service account key")?
        } else {
            rotator
                .ensure(&record.email, record.key.as_ref())
                .await
                .context("failed to ensure service account key")?
        };
        updated.key = Some(key);
        updated.spec = spec.clone();
        updated.transition(Phase::Active);
        updated.touch();

        info!(
            email = %updated.email,
            scopes = updated.bound_projects.len(),
            "integration reconciled"
        );
        Ok(updated)
    }

    /// Tear the integration down. Best effort: every removal step runs even
    /// if an earlier one fails, and a repeat call over already-deleted
    /// resources is clean.
    pub async fn delete(&self, record: &IntegrationRecord) -> Result<IntegrationRecord> {
        let roles = record.parsed_roles()?;
        let mut deleted = record.clone();
        deleted.transition(Phase::TearingDown);

        // Discovery may fail mid-deletion; the last-known bound set is
        // enough to unwind what this engine created.
        let resolver = ScopeResolver::new(&self.provider);
        let scopes = resolver
            .resolve_or_fallback(
                &record.spec.project_id,
                &record.spec.discovery(),
                &record.spec.exclusions(),
                &record.bound_projects,
                &record.bound_project_numbers,
            )
            .await;
        let map =
            ReplicationMap::rebuild(&self.provider, &roles, &scopes.project_ids()).await;

        let coordinator = TeardownCoordinator::new(&self.provider);
        let report: TeardownReport = coordinator
            .teardown(
                &record.email,
                &record.member(),
                &roles,
                &scopes,
                &map,
                record.key.as_ref().map(|k| k.name.as_str()),
            )
            .await;
        for warning in &report.warnings {
            warn!(email = %record.email, warning = %warning, "incomplete teardown step");
        }

        deleted.bound_projects = Vec::new();
        deleted.bound_project_numbers = Vec::new();
        deleted.key = None;
        deleted.transition(Phase::Deleted);
        deleted.touch();
        info!(
            email = %record.email,
            warnings = report.warnings.len(),
            "integration torn down"
        );
        Ok(deleted)
    }

    async fn resolve_scopes(&self, spec: &IntegrationSpec) -> Result<ScopeSet> {
        let resolver = ScopeResolver::new(&self.provider);
        let discovery = spec.discovery();
        let exclusions = spec.exclusions();
        let scopes = with_retry("resolve target scopes", &self.retry, || {
            resolver.resolve(&spec.project_id, &discovery, &exclusions)
        })
        .await
        .context("failed to resolve target scopes")?;
        Ok(scopes)
    }

    async fn replicate(&self, roles: &[RoleRef], scopes: &ScopeSet) -> ReplicationMap {
        let replicator = crate::roles::RoleReplicator::new(&self.provider, &self.retry);
        let mut map = ReplicationMap::default();
        replicator.replicate_all(roles, scopes, &mut map).await;
        map
    }

    /// Bind in every scope; a scope joins the bound set only when every
    /// role landed.
    async fn apply_bindings(
        &self,
        member: &str,
        roles: &[RoleRef],
        scopes: &ScopeSet,
        map: &ReplicationMap,
    ) -> (Vec<String>, Vec<i64>) {
        let reconciler = BindingReconciler::new(&self.provider);
        let mut bound = Vec::new();
        let mut numbers = Vec::new();
        for scope in scopes.iter() {
            if reconciler.apply(&scope.project_id, member, roles, map).await {
                bound.push(scope.project_id.clone());
                numbers.push(scope.project_number);
            } else {
                warn!(
                    scope = %scope.project_id,
                    "scope left out of bound set after binding failures"
                );
            }
        }
        (bound, numbers)
    }

    /// Remove grants that existed under the previous spec but are not part
    /// of the new desired state: departed scopes and dropped roles.
    async fn withdraw_stale_grants(
        &self,
        member: &str,
        record: &IntegrationRecord,
        old_roles: &[RoleRef],
        new_roles: &[RoleRef],
        scopes: &ScopeSet,
    ) {
        let old_map =
            ReplicationMap::rebuild(&self.provider, old_roles, &record.bound_projects).await;
        let reconciler = BindingReconciler::new(&self.provider);

        for project in &record.bound_projects {
            let stale: Vec<RoleRef> = old_roles
                .iter()
                .filter(|role| !scopes.contains(project) || !new_roles.contains(*role))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }
            info!(scope = %project, grants = stale.len(), "withdrawing stale grants");
            if !reconciler.remove(project, member, &stale, &old_map).await {
                warn!(scope = %project, "some stale grants could not be withdrawn");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::{RoleDefinition, ScopeInfo};
    use std::collections::BTreeSet;

    const EMAIL: &str = "fanout-sa@p1.iam.gserviceaccount.com";
    const MEMBER: &str = "serviceAccount:fanout-sa@p1.iam.gserviceaccount.com";

    fn r1() -> RoleDefinition {
        RoleDefinition {
            name: "projects/p1/roles/r1".to_string(),
            title: "Reader".to_string(),
            description: "read access".to_string(),
            included_permissions: ["storage.objects.get".to_string()]
                .into_iter()
                .collect::<BTreeSet<_>>(),
            stage: "GA".to_string(),
        }
    }

    fn spec() -> IntegrationSpec {
        IntegrationSpec {
            project_id: "p1".to_string(),
            account_id: "fanout-sa".to_string(),
            display_name: "Fan-out".to_string(),
            description: "managed identity".to_string(),
            roles: vec!["projects/p1/roles/r1".to_string()],
            central_management_folder: None,
            central_management_org: Some("org-x".to_string()),
            exclude_projects: vec!["p3".to_string()],
            exclude_free_trial_projects: false,
            rotation_token: None,
        }
    }

    fn org_env() -> FakeProvider {
        FakeProvider::new()
            .with_project(ScopeInfo::new("p1", 1001))
            .with_project(ScopeInfo::new("p2", 1002))
            .with_project(ScopeInfo::new("p3", 1003))
            .with_container("organizations/org-x", &["p1", "p2", "p3"])
            .with_role(r1())
    }

    fn engine(provider: &FakeProvider) -> IntegrationEngine<FakeProvider> {
        IntegrationEngine::new(provider.clone())
            .with_retry_policy(RetryPolicy::immediate())
            .with_propagation_wait(Duration::ZERO)
    }

    #[tokio::test]
    async fn create_fans_out_across_the_organization() {
        let provider = org_env();
        let record = engine(&provider).create(&spec()).await.unwrap();

        assert_eq!(record.phase, Phase::Active);
        assert_eq!(record.email, EMAIL);
        assert!(!record.unique_id.is_empty());
        // p3 is excluded; the anchor leads the bound set.
        assert_eq!(record.bound_projects, vec!["p1", "p2"]);
        assert_eq!(record.bound_project_numbers, vec![1001, 1002]);
        assert!(record.key.is_some());

        assert!(provider.account_exists(EMAIL));
        assert!(provider.role_exists("projects/p2/roles/r1"));
        assert!(!provider.role_exists("projects/p3/roles/r1"));
        assert!(provider.policy("p1").has_member("projects/p1/roles/r1", MEMBER));
        assert!(provider.policy("p2").has_member("projects/p2/roles/r1", MEMBER));
        assert!(!provider.policy("p3").has_member("projects/p3/roles/r1", MEMBER));
    }

    #[tokio::test]
    async fn create_adopts_existing_resources() {
        let provider = org_env();
        provider
            .create_service_account("p1", "fanout-sa", "Fan-out", "managed identity")
            .await
            .unwrap();

        let record = engine(&provider).create(&spec()).await.unwrap();
        assert_eq!(record.phase, Phase::Active);
        assert_eq!(record.bound_projects, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn replication_failure_shrinks_the_bound_set() {
        let provider = org_env().fail_role_creation_in("p2");
        let record = engine(&provider).create(&spec()).await.unwrap();

        // p2 never got its replica, so binding there fails and the scope is
        // left out; the integration still completes.
        assert_eq!(record.phase, Phase::Active);
        assert_eq!(record.bound_projects, vec!["p1"]);
        assert!(record.key.is_some());
    }

    #[tokio::test]
    async fn read_reflects_live_state() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        let refreshed = engine.read(&record).await.unwrap().unwrap();
        assert_eq!(refreshed.bound_projects, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn read_drops_drifted_scopes_without_repairing() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        provider.remove_binding_out_of_band("p2", "projects/p2/roles/r1", MEMBER);
        provider.clear_calls();

        let refreshed = engine.read(&record).await.unwrap().unwrap();
        assert_eq!(refreshed.bound_projects, vec!["p1"]);
        assert_eq!(refreshed.bound_project_numbers, vec![1001]);
        // Read never issues writes.
        assert!(provider
            .calls()
            .iter()
            .all(|c| !c.starts_with("add_binding") && !c.starts_with("remove_binding")));
    }

    #[tokio::test]
    async fn read_returns_none_when_identity_is_gone() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        provider.delete_service_account(EMAIL).await.unwrap();
        assert!(engine.read(&record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_picks_up_new_sibling_projects() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        provider.add_project_to_container("organizations/org-x", ScopeInfo::new("p4", 1004));
        let updated = engine.update(&record, &spec()).await.unwrap();

        assert_eq!(updated.bound_projects, vec!["p1", "p2", "p4"]);
        assert!(provider.role_exists("projects/p4/roles/r1"));
        assert!(provider.policy("p4").has_member("projects/p4/roles/r1", MEMBER));
    }

    #[tokio::test]
    async fn update_withdraws_grants_from_departed_scopes() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();
        assert!(provider.policy("p2").has_member("projects/p2/roles/r1", MEMBER));

        let mut narrowed = spec();
        narrowed.exclude_projects.push("p2".to_string());
        let updated = engine.update(&record, &narrowed).await.unwrap();

        assert_eq!(updated.bound_projects, vec!["p1"]);
        assert!(!provider.policy("p2").has_member("projects/p2/roles/r1", MEMBER));
        // The anchor's grant is untouched.
        assert!(provider.policy("p1").has_member("projects/p1/roles/r1", MEMBER));
    }

    #[tokio::test]
    async fn update_rejects_changed_natural_key() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        let mut renamed = spec();
        renamed.account_id = "fanout-sa2".to_string();
        let err = engine.update(&record, &renamed).await.unwrap_err();

        assert!(err.to_string().contains("immutable"));
        // No second identity was minted.
        assert!(!provider.account_exists("fanout-sa2@p1.iam.gserviceaccount.com"));
    }

    #[tokio::test]
    async fn update_without_token_change_keeps_the_key() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();
        let original_key = record.key.clone().unwrap();

        let updated = engine.update(&record, &spec()).await.unwrap();
        assert_eq!(updated.key.unwrap().name, original_key.name);
        assert_eq!(provider.key_count(), 1);
    }

    #[tokio::test]
    async fn changed_rotation_token_rotates_the_key() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();
        let original_key = record.key.clone().unwrap();

        let mut rotated_spec = spec();
        rotated_spec.rotation_token = Some("v2".to_string());
        let updated = engine.update(&record, &rotated_spec).await.unwrap();

        let new_key = updated.key.clone().unwrap();
        assert_ne!(new_key.name, original_key.name);
        assert_eq!(provider.key_count(), 1);
        assert_eq!(updated.spec.rotation_token.as_deref(), Some("v2"));

        // The same token again does not rotate.
        let again = engine.update(&updated, &rotated_spec).await.unwrap();
        assert_eq!(again.key.unwrap().name, new_key.name);
    }

    #[tokio::test]
    async fn delete_unwinds_everything() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        let deleted = engine.delete(&record).await.unwrap();
        assert_eq!(deleted.phase, Phase::Deleted);
        assert!(deleted.bound_projects.is_empty());
        assert!(deleted.key.is_none());

        assert!(!provider.account_exists(EMAIL));
        assert_eq!(provider.key_count(), 0);
        assert!(!provider.role_exists("projects/p2/roles/r1"));
        assert!(provider.role_exists("projects/p1/roles/r1"));
        assert!(!provider.policy("p2").has_member("projects/p2/roles/r1", MEMBER));
    }

    #[tokio::test]
    async fn delete_is_repeatable() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        let deleted = engine.delete(&record).await.unwrap();
        let again = engine.delete(&deleted).await.unwrap();
        assert_eq!(again.phase, Phase::Deleted);
    }

    #[tokio::test]
    async fn delete_survives_discovery_outage() {
        let provider = org_env();
        let engine = engine(&provider);
        let record = engine.create(&spec()).await.unwrap();

        provider.set_fail_listing(true);
        let deleted = engine.delete(&record).await.unwrap();

        // The last-known bound set drove the unwind.
        assert_eq!(deleted.phase, Phase::Deleted);
        assert!(!provider.account_exists(EMAIL));
        assert!(!provider.policy("p2").has_member("projects/p2/roles/r1", MEMBER));
    }
}

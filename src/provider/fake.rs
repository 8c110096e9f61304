//! In-memory fake control plane
//!
//! Backs the engine tests with the same trait seam as the REST provider.
//! Supports the failure modes that matter to reconciliation: propagation
//! lag after identity creation, listing outages, per-project policy-write
//! and role-creation failures, and out-of-band policy edits for drift
//! scenarios. Clones share state so tests can inspect it after engine
//! calls.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    CloudProvider, PolicyBinding, PolicyDocument, ProjectPage, ProviderError, RoleDefinition,
    ScopeInfo, SecretMaterial, ServiceAccountKey, ServiceIdentity,
};

#[derive(Default)]
struct FakeState {
    accounts: BTreeMap<String, ServiceIdentity>,
    account_lag: BTreeMap<String, u32>,
    roles: BTreeMap<String, RoleDefinition>,
    policies: BTreeMap<String, PolicyDocument>,
    projects: BTreeMap<String, ScopeInfo>,
    containers: BTreeMap<String, Vec<String>>,
    keys: BTreeMap<String, ServiceAccountKey>,
    key_counter: i64,
    account_counter: i64,
    propagation_lag: u32,
    page_size: usize,
    fail_listing: bool,
    fail_role_creation: BTreeSet<String>,
    fail_policy_writes: BTreeSet<String>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake provider state poisoned")
    }

    // ---- builders -------------------------------------------------------

    pub fn with_project(self, project: ScopeInfo) -> Self {
        self.state()
            .projects
            .insert(project.project_id.clone(), project);
        self
    }

    pub fn with_container(self, parent: &str, members: &[&str]) -> Self {
        self.state()
            .containers
            .insert(parent.to_string(), members.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_role(self, role: RoleDefinition) -> Self {
        self.state().roles.insert(role.name.clone(), role);
        self
    }

    /// Pages of at most `size` projects, to exercise pagination.
    pub fn with_page_size(self, size: usize) -> Self {
        self.state().page_size = size;
        self
    }

    /// Newly created accounts stay invisible to reads for `gets` calls.
    pub fn with_propagation_lag(self, gets: u32) -> Self {
        self.state().propagation_lag = gets;
        self
    }

    pub fn fail_role_creation_in(self, project_id: &str) -> Self {
        self.state().fail_role_creation.insert(project_id.to_string());
        self
    }

    // ---- runtime toggles and out-of-band edits --------------------------

    pub fn set_fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    pub fn fail_policy_writes_in(&self, project_id: &str) {
        self.state().fail_policy_writes.insert(project_id.to_string());
    }

    /// Simulate an external actor editing the policy behind the engine's
    /// back.
    pub fn remove_binding_out_of_band(&self, project_id: &str, role: &str, member: &str) {
        let mut state = self.state();
        if let Some(policy) = state.policies.get_mut(project_id) {
            for binding in policy.bindings.iter_mut() {
                if binding.role == role {
                    binding.members.remove(member);
                }
            }
            policy.bindings.retain(|b| !b.members.is_empty());
        }
    }

    pub fn add_project_to_container(&self, parent: &str, project: ScopeInfo) {
        let mut state = self.state();
        state
            .containers
            .entry(parent.to_string())
            .or_default()
            .push(project.project_id.clone());
        state.projects.insert(project.project_id.clone(), project);
    }

    // ---- inspection -----------------------------------------------------

    pub fn account(&self, email: &str) -> Option<ServiceIdentity> {
        self.state().accounts.get(email).cloned()
    }

    pub fn account_exists(&self, email: &str) -> bool {
        self.state().accounts.contains_key(email)
    }

    pub fn role(&self, name: &str) -> Option<RoleDefinition> {
        self.state().roles.get(name).cloned()
    }

    pub fn role_exists(&self, name: &str) -> bool {
        self.state().roles.contains_key(name)
    }

    pub fn policy(&self, project_id: &str) -> PolicyDocument {
        self.state().policies.get(project_id).cloned().unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.state().keys.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

fn cross_project_role(project_id: &str, role: &str) -> bool {
    let mut parts = role.split('/');
    matches!(
        (parts.next(), parts.next()),
        (Some("projects"), Some(origin)) if origin != project_id
    )
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceIdentity, ProviderError> {
        let mut state = self.state();
        let email = format!("{}@{}.iam.gserviceaccount.com", account_id, project_id);
        state.calls.push(format!("create_service_account {}", email));

        if state.accounts.contains_key(&email) {
            return Err(ProviderError::already_exists(
                "create service account",
                format!("{} already exists", email),
            ));
        }

        state.account_counter += 1;
        let identity = ServiceIdentity {
            project_id: project_id.to_string(),
            account_id: account_id.to_string(),
            email: email.clone(),
            unique_id: format!("1{:017}", state.account_counter),
            display_name: display_name.to_string(),
            description: description.to_string(),
        };
        state.accounts.insert(email.clone(), identity.clone());
        let lag = state.propagation_lag;
        if lag > 0 {
            state.account_lag.insert(email, lag);
        }
        Ok(identity)
    }

    async fn get_service_account(&self, email: &str) -> Result<ServiceIdentity, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("get_service_account {}", email));

        if let Some(remaining) = state.account_lag.get_mut(email) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::transient(
                    "get service account",
                    format!("{} not yet visible", email),
                ));
            }
        }

        state
            .accounts
            .get(email)
            .cloned()
            .ok_or_else(|| {
                ProviderError::not_found("get service account", format!("{} not found", email))
            })
    }

    async fn patch_service_account(
        &self,
        email: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceIdentity, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("patch_service_account {}", email));

        match state.accounts.get_mut(email) {
            Some(identity) => {
                identity.display_name = display_name.to_string();
                identity.description = description.to_string();
                Ok(identity.clone())
            }
            None => Err(ProviderError::not_found(
                "patch service account",
                format!("{} not found", email),
            )),
        }
    }

    async fn delete_service_account(&self, email: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("delete_service_account {}", email));

        match state.accounts.remove(email) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(
                "delete service account",
                format!("{} not found", email),
            )),
        }
    }

    async fn get_role(&self, name: &str) -> Result<RoleDefinition, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("get_role {}", name));

        state
            .roles
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("get role", format!("{} not found", name)))
    }

    async fn create_role(
        &self,
        project_id: &str,
        role_id: &str,
        definition: &RoleDefinition,
    ) -> Result<RoleDefinition, ProviderError> {
        let mut state = self.state();
        let name = format!("projects/{}/roles/{}", project_id, role_id);
        state.calls.push(format!("create_role {}", name));

        if state.fail_role_creation.contains(project_id) {
            return Err(ProviderError::fatal(
                "create role",
                format!("permission denied creating roles in {}", project_id),
            ));
        }
        if state.roles.contains_key(&name) {
            return Err(ProviderError::already_exists(
                "create role",
                format!("{} already exists", name),
            ));
        }

        let mut role = definition.clone();
        role.name = name.clone();
        state.roles.insert(name, role.clone());
        Ok(role)
    }

    async fn patch_role(
        &self,
        name: &str,
        definition: &RoleDefinition,
    ) -> Result<RoleDefinition, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("patch_role {}", name));

        match state.roles.get_mut(name) {
            Some(role) => {
                role.title = definition.title.clone();
                role.description = definition.description.clone();
                role.included_permissions = definition.included_permissions.clone();
                role.stage = definition.stage.clone();
                Ok(role.clone())
            }
            None => Err(ProviderError::not_found(
                "patch role",
                format!("{} not found", name),
            )),
        }
    }

    async fn delete_role(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("delete_role {}", name));

        match state.roles.remove(name) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(
                "delete role",
                format!("{} not found", name),
            )),
        }
    }

    async fn get_iam_policy(&self, project_id: &str) -> Result<PolicyDocument, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("get_iam_policy {}", project_id));

        if !state.projects.contains_key(project_id) && !state.policies.contains_key(project_id) {
            return Err(ProviderError::not_found(
                "get iam policy",
                format!("project {} not found", project_id),
            ));
        }
        Ok(state.policies.get(project_id).cloned().unwrap_or_default())
    }

    async fn add_binding(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("add_binding {} {} {}", project_id, role, member));

        if state.fail_policy_writes.contains(project_id) {
            return Err(ProviderError::transient(
                "set iam policy",
                format!("policy backend unavailable for {}", project_id),
            ));
        }
        if cross_project_role(project_id, role) {
            return Err(ProviderError::fatal(
                "set iam policy",
                format!("role {} is not usable in project {}", role, project_id),
            ));
        }
        if role.starts_with("projects/") && !state.roles.contains_key(role) {
            return Err(ProviderError::fatal(
                "set iam policy",
                format!("role {} does not exist", role),
            ));
        }

        let policy = state.policies.entry(project_id.to_string()).or_default();
        match policy.bindings.iter_mut().find(|b| b.role == role) {
            Some(binding) => {
                binding.members.insert(member.to_string());
            }
            None => policy.bindings.push(PolicyBinding {
                role: role.to_string(),
                members: [member.to_string()].into_iter().collect(),
            }),
        }
        Ok(())
    }

    async fn remove_binding(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("remove_binding {} {} {}", project_id, role, member));

        if state.fail_policy_writes.contains(project_id) {
            return Err(ProviderError::transient(
                "set iam policy",
                format!("policy backend unavailable for {}", project_id),
            ));
        }

        let removed = state
            .policies
            .get_mut(project_id)
            .and_then(|policy| {
                let binding = policy.bindings.iter_mut().find(|b| b.role == role)?;
                Some(binding.members.remove(member))
            })
            .unwrap_or(false);

        if let Some(policy) = state.policies.get_mut(project_id) {
            policy.bindings.retain(|b| !b.members.is_empty());
        }

        if removed {
            Ok(())
        } else {
            Err(ProviderError::not_found(
                "set iam policy",
                format!("{} is not bound to {} in {}", member, role, project_id),
            ))
        }
    }

    async fn get_project(&self, project_id: &str) -> Result<ScopeInfo, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("get_project {}", project_id));

        state
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| {
                ProviderError::not_found("get project", format!("{} not found", project_id))
            })
    }

    async fn list_projects(
        &self,
        parent: &str,
        page_token: Option<&str>,
    ) -> Result<ProjectPage, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("list_projects {}", parent));

        if state.fail_listing {
            return Err(ProviderError::transient(
                "list projects",
                "resource manager unavailable",
            ));
        }

        let members = state
            .containers
            .get(parent)
            .cloned()
            .ok_or_else(|| {
                ProviderError::not_found("list projects", format!("{} not found", parent))
            })?;

        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let page_size = if state.page_size == 0 {
            members.len().max(1)
        } else {
            state.page_size
        };
        let end = (start + page_size).min(members.len());

        let projects = members[start..end]
            .iter()
            .filter_map(|id| state.projects.get(id).cloned())
            .collect();
        let next_page_token = if end < members.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(ProjectPage {
            projects,
            next_page_token,
        })
    }

    async fn create_service_account_key(
        &self,
        email: &str,
    ) -> Result<ServiceAccountKey, ProviderError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("create_service_account_key {}", email));

        state.key_counter += 1;
        let counter = state.key_counter;
        // Strictly increasing validity windows, even within one test tick.
        let valid_after = Utc::now() + ChronoDuration::milliseconds(counter);
        let key = ServiceAccountKey {
            name: format!(
                "projects/-/serviceAccounts/{}/keys/fake-key-{}",
                email, counter
            ),
            valid_after,
            valid_before: valid_after + ChronoDuration::days(3650),
            private_key: SecretMaterial::new(format!("fake-private-key-{}", counter)),
        };
        state.keys.insert(key.name.clone(), key.clone());
        Ok(key)
    }

    async fn delete_service_account_key(&self, key_name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("delete_service_account_key {}", key_name));

        match state.keys.remove(key_name) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(
                "delete service account key",
                format!("{} not found", key_name),
            )),
        }
    }
}

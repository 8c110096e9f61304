//! Cloud provider abstraction
//!
//! Every external control-plane call goes through the [`CloudProvider`]
//! trait so the engine can be driven against the real REST surface or the
//! in-memory fake. Errors carry a typed [`ErrorKind`] so retry and adoption
//! decisions never depend on matching error message text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

pub mod fake;
pub mod gcp;

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The resource already exists; callers may adopt it.
    AlreadyExists,
    /// The resource is absent; callers may treat it as already gone.
    NotFound,
    /// Propagation lag or a temporarily unavailable backend; safe to retry.
    Transient,
    /// Validation or permission failure; retrying cannot help.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::AlreadyExists => write!(f, "already exists"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// A classified failure from the cloud control plane.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct ProviderError {
    kind: ErrorKind,
    operation: String,
    message: String,
}

impl ProviderError {
    pub fn new(
        kind: ErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, operation, message)
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, operation, message)
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, operation, message)
    }

    pub fn fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, operation, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Annotate the error with the number of attempts spent on it.
    pub fn after_attempts(mut self, attempts: u32) -> Self {
        self.message = format!("{} (after {} attempts)", self.message, attempts);
        self
    }
}

/// A provisioned service identity as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub project_id: String,
    pub account_id: String,
    pub email: String,
    pub unique_id: String,
    pub display_name: String,
    pub description: String,
}

/// A custom role definition.
///
/// `name` is the full resource name, either `projects/{p}/roles/{id}` or
/// `organizations/{o}/roles/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub title: String,
    pub description: String,
    pub included_permissions: BTreeSet<String>,
    pub stage: String,
}

impl RoleDefinition {
    /// The short role id (last path segment of the resource name).
    pub fn role_id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// One project under a folder or organization container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub project_id: String,
    pub project_number: i64,
    pub free_trial: bool,
}

impl ScopeInfo {
    pub fn new(project_id: impl Into<String>, project_number: i64) -> Self {
        Self {
            project_id: project_id.into(),
            project_number,
            free_trial: false,
        }
    }

    pub fn free_trial(mut self) -> Self {
        self.free_trial = true;
        self
    }
}

/// One page of a project listing.
#[derive(Debug, Clone, Default)]
pub struct ProjectPage {
    pub projects: Vec<ScopeInfo>,
    pub next_page_token: Option<String>,
}

/// A scope's access-policy document: the system of record for bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub bindings: Vec<PolicyBinding>,
    #[serde(default)]
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub role: String,
    pub members: BTreeSet<String>,
}

impl PolicyDocument {
    /// Whether `member` is bound to `role` in this document.
    pub fn has_member(&self, role: &str, member: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.role == role && b.members.contains(member))
    }
}

/// Opaque secret bytes that must never appear in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMaterial(String);

impl SecretMaterial {
    pub fn new(material: impl Into<String>) -> Self {
        Self(material.into())
    }

    /// Deliberately explicit accessor; call sites that export the secret
    /// must opt in by name.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial(<redacted>)")
    }
}

/// A keyed credential for a service identity.
///
/// At most one key is active per identity; rotation is delete-then-create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    pub name: String,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
    /// Sensitive: the provider-minted private key payload.
    pub private_key: SecretMaterial,
}

/// The cloud control-plane surface consumed by the engine.
///
/// Implementations classify every failure into an [`ErrorKind`]; callers
/// never inspect message text to decide behavior.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    // Service identities
    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceIdentity, ProviderError>;

    async fn get_service_account(&self, email: &str) -> Result<ServiceIdentity, ProviderError>;

    /// Patch mutable fields only (display name, description).
    async fn patch_service_account(
        &self,
        email: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceIdentity, ProviderError>;

    async fn delete_service_account(&self, email: &str) -> Result<(), ProviderError>;

    // Custom roles
    async fn get_role(&self, name: &str) -> Result<RoleDefinition, ProviderError>;

    async fn create_role(
        &self,
        project_id: &str,
        role_id: &str,
        definition: &RoleDefinition,
    ) -> Result<RoleDefinition, ProviderError>;

    /// Patch mutable fields of an existing role (title, description,
    /// permissions, stage); the resource name is never changed.
    async fn patch_role(
        &self,
        name: &str,
        definition: &RoleDefinition,
    ) -> Result<RoleDefinition, ProviderError>;

    async fn delete_role(&self, name: &str) -> Result<(), ProviderError>;

    // Access policy, read-modify-written per scope
    async fn get_iam_policy(&self, project_id: &str) -> Result<PolicyDocument, ProviderError>;

    async fn add_binding(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), ProviderError>;

    async fn remove_binding(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), ProviderError>;

    // Resource manager
    async fn get_project(&self, project_id: &str) -> Result<ScopeInfo, ProviderError>;

    /// List projects under `parent` (`folders/{id}` or `organizations/{id}`).
    /// Returns one page; callers page until `next_page_token` is empty.
    async fn list_projects(
        &self,
        parent: &str,
        page_token: Option<&str>,
    ) -> Result<ProjectPage, ProviderError>;

    // Keyed credentials
    async fn create_service_account_key(
        &self,
        email: &str,
    ) -> Result<ServiceAccountKey, ProviderError>;

    async fn delete_service_account_key(&self, key_name: &str) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_operation_and_kind() {
        let err = ProviderError::transient("create role", "backend unavailable");
        let rendered = err.to_string();
        assert!(rendered.contains("create role"));
        assert!(rendered.contains("transient"));
        assert!(rendered.contains("backend unavailable"));
    }

    #[test]
    fn after_attempts_annotates_message() {
        let err = ProviderError::transient("get account", "not yet visible").after_attempts(4);
        assert!(err.to_string().contains("after 4 attempts"));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn secret_material_debug_is_redacted() {
        let secret = SecretMaterial::new("super-private-pem");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-private-pem"));
        assert!(debug.contains("redacted"));
        assert_eq!(secret.expose(), "super-private-pem");
    }

    #[test]
    fn policy_membership_check() {
        let policy = PolicyDocument {
            bindings: vec![PolicyBinding {
                role: "projects/p1/roles/r1".to_string(),
                members: ["serviceAccount:sa@p1.iam.gserviceaccount.com".to_string()]
                    .into_iter()
                    .collect(),
            }],
            etag: String::new(),
        };

        assert!(policy.has_member(
            "projects/p1/roles/r1",
            "serviceAccount:sa@p1.iam.gserviceaccount.com"
        ));
        assert!(!policy.has_member(
            "projects/p1/roles/r2",
            "serviceAccount:sa@p1.iam.gserviceaccount.com"
        ));
        assert!(!policy.has_member("projects/p1/roles/r1", "user:someone@example.com"));
    }

    #[test]
    fn role_id_is_last_segment() {
        let role = RoleDefinition {
            name: "projects/p1/roles/log_writer".to_string(),
            title: "Log Writer".to_string(),
            description: String::new(),
            included_permissions: BTreeSet::new(),
            stage: "GA".to_string(),
        };
        assert_eq!(role.role_id(), "log_writer");
    }
}

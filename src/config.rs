//! Desired-state record and validation
//!
//! The orchestration framework hands the engine a flat field record. It is
//! validated up front: configuration errors are fatal before any control
//! plane call is made.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::roles::RoleRef;
use crate::scopes::{Discovery, Exclusions};

/// A configuration problem in the desired-state record. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("central_management_folder and central_management_org are mutually exclusive")]
    ConflictingDiscoveryModes,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid account_id {0:?}: must be 6-30 characters, start with a lowercase letter, and contain only lowercase letters, digits, and hyphens")]
    InvalidAccountId(String),

    #[error("invalid role reference {0:?}: expected projects/{{id}}/roles/{{role}}, organizations/{{id}}/roles/{{role}}, or roles/{{role}}")]
    InvalidRoleRef(String),
}

/// Desired state of one cross-project IAM integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSpec {
    /// Anchor project: the service identity lives here, and discovery starts
    /// from it.
    pub project_id: String,
    /// Immutable short name of the service identity.
    pub account_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Role references to bind in every target scope, as configured.
    pub roles: Vec<String>,
    /// Enumerate sibling projects under this folder.
    #[serde(default)]
    pub central_management_folder: Option<String>,
    /// Enumerate sibling projects under this organization.
    #[serde(default)]
    pub central_management_org: Option<String>,
    /// Projects excluded from the target set even if discovered.
    #[serde(default)]
    pub exclude_projects: Vec<String>,
    /// Skip projects flagged as free-trial.
    #[serde(default)]
    pub exclude_free_trial_projects: bool,
    /// Opaque rotation trigger: any change in value requests a key rotation.
    #[serde(default)]
    pub rotation_token: Option<String>,
}

impl IntegrationSpec {
    /// Validate required fields and mode exclusivity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.is_empty() {
            return Err(ConfigError::MissingField("project_id"));
        }
        if self.account_id.is_empty() {
            return Err(ConfigError::MissingField("account_id"));
        }
        if !valid_account_id(&self.account_id) {
            return Err(ConfigError::InvalidAccountId(self.account_id.clone()));
        }
        if self.roles.is_empty() {
            return Err(ConfigError::MissingField("roles"));
        }
        if self.central_management_folder.is_some() && self.central_management_org.is_some() {
            return Err(ConfigError::ConflictingDiscoveryModes);
        }
        self.parsed_roles().map(|_| ())
    }

    /// Parse the configured role references.
    pub fn parsed_roles(&self) -> Result<Vec<RoleRef>, ConfigError> {
        self.roles.iter().map(|r| RoleRef::parse(r)).collect()
    }

    /// How target scopes are discovered.
    pub fn discovery(&self) -> Discovery {
        if let Some(folder) = &self.central_management_folder {
            Discovery::Folder(folder.clone())
        } else if let Some(org) = &self.central_management_org {
            Discovery::Organization(org.clone())
        } else {
            Discovery::SingleProject
        }
    }

    /// Exclusion predicates applied during discovery.
    pub fn exclusions(&self) -> Exclusions {
        Exclusions {
            projects: self.exclude_projects.iter().cloned().collect::<BTreeSet<_>>(),
            free_trial: self.exclude_free_trial_projects,
        }
    }

    /// The identity's email, derived from the immutable natural key.
    pub fn email(&self) -> String {
        format!("{}@{}.iam.gserviceaccount.com", self.account_id, self.project_id)
    }

    /// The policy member string for the identity.
    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.email())
    }
}

fn valid_account_id(account_id: &str) -> bool {
    let len = account_id.len();
    if !(6..=30).contains(&len) {
        return false;
    }
    let mut chars = account_id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

//! Persisted integration record
//!
//! One flat record per resource instance is the only durable memory across
//! invocations. Everything else (scope membership, replica locations) is
//! re-derived from it plus live provider queries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::config::{ConfigError, IntegrationSpec};
use crate::provider::ServiceAccountKey;
use crate::roles::RoleRef;

/// Reconciliation phase of an integration.
///
/// The fixed step ordering (identity before bindings, bindings before the
/// key; bindings removed before the identity on teardown) is expressed as
/// explicit states so partial-failure resumption points stay visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provisioning,
    Replicating,
    Binding,
    Keyed,
    Active,
    TearingDown,
    Deleted,
}

impl Phase {
    /// Legal forward transitions. Teardown may start from any phase, and may
    /// be re-entered after completion since every step tolerates absence.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (_, TearingDown) => true,
            (TearingDown, Deleted) => true,
            (Provisioning, Replicating)
            | (Replicating, Binding)
            | (Binding, Keyed)
            | (Keyed, Active) => true,
            // An update re-enters the reconcile sequence from Active.
            (Active, Replicating) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Deleted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Provisioning => "provisioning",
            Phase::Replicating => "replicating",
            Phase::Binding => "binding",
            Phase::Keyed => "keyed",
            Phase::Active => "active",
            Phase::TearingDown => "tearing_down",
            Phase::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// The flat record persisted between invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    /// Desired-state fields, carried verbatim.
    #[serde(flatten)]
    pub spec: IntegrationSpec,
    pub phase: Phase,
    /// Observed identity fields.
    pub email: String,
    pub unique_id: String,
    /// Scopes where every configured role binding succeeded, with the
    /// parallel project-number list.
    pub bound_projects: Vec<String>,
    pub bound_project_numbers: Vec<i64>,
    /// Metadata and (sensitive) material of the active key, if any.
    pub key: Option<ServiceAccountKey>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRecord {
    pub fn new(spec: &IntegrationSpec) -> Self {
        Self {
            email: spec.email(),
            spec: spec.clone(),
            phase: Phase::Provisioning,
            unique_id: String::new(),
            bound_projects: Vec::new(),
            bound_project_numbers: Vec::new(),
            key: None,
            updated_at: Utc::now(),
        }
    }

    /// Advance the phase machine. Illegal transitions are a programming
    /// error in the engine's step ordering.
    pub fn transition(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase transition {} -> {}",
            self.phase,
            next
        );
        debug!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn parsed_roles(&self) -> Result<Vec<RoleRef>, ConfigError> {
        self.spec.parsed_roles()
    }

    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.email)
    }

    /// Load a record from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read record file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse record file {}", path.display()))
    }

    /// Persist the record as pretty-printed JSON.
    pub fn store(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).context("failed to serialize record")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write record file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SecretMaterial;

    fn spec() -> IntegrationSpec {
        IntegrationSpec {
            project_id: "p1".to_string(),
            account_id: "fanout-sa".to_string(),
            display_name: "Fan-out".to_string(),
            description: String::new(),
            roles: vec!["projects/p1/roles/r1".to_string()],
            central_management_folder: None,
            central_management_org: Some("org-x".to_string()),
            exclude_projects: vec![],
            exclude_free_trial_projects: false,
            rotation_token: Some("v1".to_string()),
        }
    }

    fn record() -> IntegrationRecord {
        let mut record = IntegrationRecord::new(&spec());
        record.unique_id = "100000000000000001".to_string();
        record.bound_projects = vec!["p1".to_string(), "p2".to_string()];
        record.bound_project_numbers = vec![1001, 1002];
        record.key = Some(ServiceAccountKey {
            name: "projects/-/serviceAccounts/sa/keys/k1".to_string(),
            valid_after: Utc::now(),
            valid_before: Utc::now(),
            private_key: SecretMaterial::new("material"),
        });
        record.phase = Phase::Active;
        record
    }

    #[test]
    fn phase_transition_table() {
        use Phase::*;
        assert!(Provisioning.can_advance_to(Replicating));
        assert!(Replicating.can_advance_to(Binding));
        assert!(Binding.can_advance_to(Keyed));
        assert!(Keyed.can_advance_to(Active));
        assert!(Active.can_advance_to(Replicating));
        assert!(Active.can_advance_to(TearingDown));
        assert!(TearingDown.can_advance_to(Deleted));
        // Teardown is re-enterable.
        assert!(Deleted.can_advance_to(TearingDown));

        assert!(!Provisioning.can_advance_to(Binding));
        assert!(!Binding.can_advance_to(Active));
        assert!(!Deleted.can_advance_to(Replicating));
        assert!(Deleted.is_terminal());
    }

    #[test]
    fn record_is_flat_json() {
        let value = serde_json::to_value(record()).unwrap();
        // Spec fields are flattened alongside observed fields.
        assert_eq!(value["project_id"], "p1");
        assert_eq!(value["rotation_token"], "v1");
        assert_eq!(value["phase"], "active");
        assert_eq!(value["bound_projects"][1], "p2");
        assert_eq!(value["bound_project_numbers"][1], 1002);
    }

    #[test]
    fn record_round_trips_through_json() {
        let original = record();
        let json = serde_json::to_string(&original).unwrap();
        let parsed: IntegrationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn record_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");

        let original = record();
        original.store(&path).unwrap();
        let loaded = IntegrationRecord::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = IntegrationRecord::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }
}

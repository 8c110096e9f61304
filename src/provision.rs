//! Idempotent create-or-adopt provisioning
//!
//! A provider "already exists" answer is not a failure: the existing
//! resource is looked up by its natural key and adopted. Adoption never
//! overwrites the configured natural-key fields with provider-normalized
//! echoes (a project-number form of the parent, for example), because those
//! would show up as spurious drift on every later reconciliation. Mutable
//! fields are reconciled with an explicit field-mask patch instead.

use tracing::{debug, info};

use crate::provider::{CloudProvider, ErrorKind, ProviderError, RoleDefinition, ServiceIdentity};
use crate::retry::{with_retry, RetryPolicy};

/// Result of an idempotent provisioning call.
#[derive(Debug, Clone)]
pub struct Provisioned<T> {
    pub handle: T,
    /// True when the resource already existed and was adopted.
    pub adopted: bool,
}

/// Create the service identity, or adopt it if it already exists.
pub async fn ensure_service_account<P: CloudProvider>(
    provider: &P,
    retry: &RetryPolicy,
    project_id: &str,
    account_id: &str,
    display_name: &str,
    description: &str,
) -> Result<Provisioned<ServiceIdentity>, ProviderError> {
    let email = format!("{}@{}.iam.gserviceaccount.com", account_id, project_id);

    let created = with_retry("create service account", retry, || {
        provider.create_service_account(project_id, account_id, display_name, description)
    })
    .await;

    let mut identity = match created {
        Ok(identity) => {
            info!(email = %email, "created service identity");
            return Ok(Provisioned {
                handle: pin_natural_key(identity, project_id, account_id, &email),
                adopted: false,
            });
        }
        Err(err) if err.is(ErrorKind::AlreadyExists) => {
            debug!(email = %email, "service identity already exists, adopting");
            with_retry("get service account", retry, || {
                provider.get_service_account(&email)
            })
            .await?
        }
        Err(err) => return Err(err),
    };

    // Reconcile mutable fields on the adopted resource.
    if identity.display_name != display_name || identity.description != description {
        identity = with_retry("patch service account", retry, || {
            provider.patch_service_account(&email, display_name, description)
        })
        .await?;
        info!(email = %email, "patched adopted service identity");
    }

    Ok(Provisioned {
        handle: pin_natural_key(identity, project_id, account_id, &email),
        adopted: true,
    })
}

/// Keep the configured natural key, not the provider's normalized echo.
fn pin_natural_key(
    mut identity: ServiceIdentity,
    project_id: &str,
    account_id: &str,
    email: &str,
) -> ServiceIdentity {
    identity.project_id = project_id.to_string();
    identity.account_id = account_id.to_string();
    identity.email = email.to_string();
    identity
}

/// Create a custom role in `project_id`, or adopt an existing one.
pub async fn ensure_role<P: CloudProvider>(
    provider: &P,
    retry: &RetryPolicy,
    project_id: &str,
    role_id: &str,
    definition: &RoleDefinition,
) -> Result<Provisioned<RoleDefinition>, ProviderError> {
    let name = format!("projects/{}/roles/{}", project_id, role_id);

    let created = with_retry("create role", retry, || {
        provider.create_role(project_id, role_id, definition)
    })
    .await;

    match created {
        Ok(role) => Ok(Provisioned {
            handle: role,
            adopted: false,
        }),
        Err(err) if err.is(ErrorKind::AlreadyExists) => {
            debug!(role = %name, "role already exists, adopting");
            let mut role = with_retry("get role", retry, || provider.get_role(&name)).await?;
            // Reconcile mutable fields on the adopted role; a stale
            // permission set must not survive adoption.
            if role_fields_differ(&role, definition) {
                role = with_retry("patch role", retry, || {
                    provider.patch_role(&name, definition)
                })
                .await?;
                info!(role = %name, "patched adopted role");
            }
            Ok(Provisioned {
                handle: role,
                adopted: true,
            })
        }
        Err(err) => Err(err),
    }
}

fn role_fields_differ(current: &RoleDefinition, desired: &RoleDefinition) -> bool {
    current.title != desired.title
        || current.description != desired.description
        || current.included_permissions != desired.included_permissions
        || current.stage != desired.stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use std::collections::BTreeSet;

    fn retry() -> RetryPolicy {
        RetryPolicy::immediate()
    }

    #[tokio::test]
    async fn second_call_adopts_without_error() {
        let provider = FakeProvider::new();

        let first = ensure_service_account(&provider, &retry(), "p1", "fanout-sa", "Fan-out", "")
            .await
            .unwrap();
        assert!(!first.adopted);

        let second = ensure_service_account(&provider, &retry(), "p1", "fanout-sa", "Fan-out", "")
            .await
            .unwrap();
        assert!(second.adopted);
        assert_eq!(second.handle.email, first.handle.email);
    }

    #[tokio::test]
    async fn adoption_patches_mutable_fields_only() {
        let provider = FakeProvider::new();
        provider
            .create_service_account("p1", "fanout-sa", "old name", "old description")
            .await
            .unwrap();

        let adopted =
            ensure_service_account(&provider, &retry(), "p1", "fanout-sa", "new name", "new desc")
                .await
                .unwrap();

        assert!(adopted.adopted);
        assert_eq!(adopted.handle.display_name, "new name");
        assert_eq!(adopted.handle.description, "new desc");
        // Natural key untouched.
        assert_eq!(adopted.handle.project_id, "p1");
        assert_eq!(adopted.handle.account_id, "fanout-sa");

        let stored = provider
            .account("fanout-sa@p1.iam.gserviceaccount.com")
            .unwrap();
        assert_eq!(stored.display_name, "new name");
    }

    #[tokio::test]
    async fn adoption_does_not_patch_when_fields_match() {
        let provider = FakeProvider::new();
        provider
            .create_service_account("p1", "fanout-sa", "same", "same desc")
            .await
            .unwrap();
        provider.clear_calls();

        let adopted =
            ensure_service_account(&provider, &retry(), "p1", "fanout-sa", "same", "same desc")
                .await
                .unwrap();

        assert!(adopted.adopted);
        let calls = provider.calls();
        assert!(!calls.iter().any(|c| c.starts_with("patch_service_account")));
    }

    #[tokio::test]
    async fn creation_retries_through_propagation_lag() {
        // Lag applies to reads after creation; adoption's lookup must retry
        // past it rather than fail.
        let provider = FakeProvider::new().with_propagation_lag(2);
        provider
            .create_service_account("p1", "fanout-sa", "n", "")
            .await
            .unwrap();

        let adopted = ensure_service_account(&provider, &retry(), "p1", "fanout-sa", "n", "")
            .await
            .unwrap();
        assert!(adopted.adopted);
    }

    #[tokio::test]
    async fn role_provisioning_is_idempotent() {
        let provider = FakeProvider::new();
        let definition = RoleDefinition {
            name: "projects/p2/roles/r1".to_string(),
            title: "Reader".to_string(),
            description: String::new(),
            included_permissions: BTreeSet::new(),
            stage: "GA".to_string(),
        };

        let first = ensure_role(&provider, &retry(), "p2", "r1", &definition)
            .await
            .unwrap();
        assert!(!first.adopted);

        let second = ensure_role(&provider, &retry(), "p2", "r1", &definition)
            .await
            .unwrap();
        assert!(second.adopted);
        assert_eq!(second.handle.name, "projects/p2/roles/r1");
    }

    #[tokio::test]
    async fn role_adoption_patches_stale_fields() {
        let provider = FakeProvider::new();
        let stale = RoleDefinition {
            name: "projects/p2/roles/r1".to_string(),
            title: "Old Title".to_string(),
            description: String::new(),
            included_permissions: ["storage.objects.list".to_string()].into_iter().collect(),
            stage: "BETA".to_string(),
        };
        provider.create_role("p2", "r1", &stale).await.unwrap();

        let desired = RoleDefinition {
            name: "projects/p2/roles/r1".to_string(),
            title: "New Title".to_string(),
            description: "read access".to_string(),
            included_permissions: ["storage.objects.get".to_string()].into_iter().collect(),
            stage: "GA".to_string(),
        };
        let adopted = ensure_role(&provider, &retry(), "p2", "r1", &desired)
            .await
            .unwrap();

        assert!(adopted.adopted);
        assert_eq!(adopted.handle.title, "New Title");
        let stored = provider.role("projects/p2/roles/r1").unwrap();
        assert_eq!(stored.included_permissions, desired.included_permissions);
        assert_eq!(stored.stage, "GA");
    }

    #[tokio::test]
    async fn role_adoption_does_not_patch_when_fields_match() {
        let provider = FakeProvider::new();
        let definition = RoleDefinition {
            name: "projects/p2/roles/r1".to_string(),
            title: "Reader".to_string(),
            description: "read access".to_string(),
            included_permissions: BTreeSet::new(),
            stage: "GA".to_string(),
        };
        provider.create_role("p2", "r1", &definition).await.unwrap();
        provider.clear_calls();

        let adopted = ensure_role(&provider, &retry(), "p2", "r1", &definition)
            .await
            .unwrap();

        assert!(adopted.adopted);
        let calls = provider.calls();
        assert!(!calls.iter().any(|c| c.starts_with("patch_role")));
    }
}

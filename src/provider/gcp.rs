//! REST implementation of the provider trait
//!
//! Talks to the IAM and Resource Manager v3 APIs with a bearer token.
//! Policy bindings are applied read-modify-write against the scope's policy
//! document, carrying the etag so a concurrent writer surfaces as a
//! retryable conflict instead of a lost update.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    CloudProvider, ErrorKind, PolicyBinding, PolicyDocument, ProjectPage, ProviderError,
    RoleDefinition, ScopeInfo, SecretMaterial, ServiceAccountKey, ServiceIdentity,
};

const IAM_BASE: &str = "https://iam.googleapis.com/v1";
const CRM_BASE: &str = "https://cloudresourcemanager.googleapis.com/v3";
/// Project label marking free-trial billing.
const FREE_TRIAL_LABEL: &str = "free-trial";

pub struct GcpProvider {
    client: reqwest::Client,
    access_token: String,
}

impl GcpProvider {
    pub fn new(access_token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            access_token,
        })
    }

    /// Build a provider with a token from the ambient environment:
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, then the metadata server, then the
    /// gcloud CLI.
    pub async fn from_env() -> Result<Self> {
        let token = fetch_access_token().await?;
        Self::new(token)
    }

    async fn execute(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ProviderError> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ProviderError::transient(operation, e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        let message = body["error"]["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status));
        Err(ProviderError::new(
            classify_status(status),
            operation,
            message,
        ))
    }
}

/// Map an HTTP status to the error taxonomy. Conflicts are "already
/// exists" by default; setIamPolicy etag races are re-classified by the
/// caller.
fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::CONFLICT => ErrorKind::AlreadyExists,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::Transient,
        s if s.is_server_error() => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountDto {
    #[serde(default)]
    project_id: String,
    email: String,
    #[serde(default)]
    unique_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    description: String,
}

impl ServiceAccountDto {
    fn into_identity(self) -> ServiceIdentity {
        let account_id = self.email.split('@').next().unwrap_or_default().to_string();
        ServiceIdentity {
            project_id: self.project_id,
            account_id,
            email: self.email,
            unique_id: self.unique_id,
            display_name: self.display_name,
            description: self.description,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleDto {
    #[serde(default)]
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    included_permissions: Vec<String>,
    #[serde(default)]
    stage: String,
}

impl RoleDto {
    fn into_definition(self) -> RoleDefinition {
        RoleDefinition {
            name: self.name,
            title: self.title,
            description: self.description,
            included_permissions: self.included_permissions.into_iter().collect(),
            stage: self.stage,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDto {
    /// `projects/{number}` in the v3 surface.
    name: String,
    project_id: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl ProjectDto {
    fn into_scope(self) -> Result<ScopeInfo, ProviderError> {
        let number = project_number(&self.name).ok_or_else(|| {
            ProviderError::fatal(
                "parse project",
                format!("unexpected project resource name {:?}", self.name),
            )
        })?;
        let free_trial = self
            .labels
            .get(FREE_TRIAL_LABEL)
            .map(|v| v == "true")
            .unwrap_or(false);
        let mut scope = ScopeInfo::new(self.project_id, number);
        if free_trial {
            scope = scope.free_trial();
        }
        Ok(scope)
    }
}

fn project_number(resource_name: &str) -> Option<i64> {
    resource_name.strip_prefix("projects/")?.parse().ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDto {
    name: String,
    valid_after_time: DateTime<Utc>,
    valid_before_time: DateTime<Utc>,
    /// Base64 of the provider-minted credential file.
    private_key_data: String,
}

impl KeyDto {
    fn into_key(self) -> Result<ServiceAccountKey, ProviderError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&self.private_key_data)
            .map_err(|e| ProviderError::fatal("decode key material", e.to_string()))?;
        let material = String::from_utf8(decoded)
            .map_err(|e| ProviderError::fatal("decode key material", e.to_string()))?;
        Ok(ServiceAccountKey {
            name: self.name,
            valid_after: self.valid_after_time,
            valid_before: self.valid_before_time,
            private_key: SecretMaterial::new(material),
        })
    }
}

#[async_trait]
impl CloudProvider for GcpProvider {
    async fn create_service_account(
        &self,
        project_id: &str,
        account_id: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceIdentity, ProviderError> {
        let url = format!("{}/projects/{}/serviceAccounts", IAM_BASE, project_id);
        let body = json!({
            "accountId": account_id,
            "serviceAccount": {
                "displayName": display_name,
                "description": description,
            }
        });
        let value = self
            .execute("create service account", self.client.post(&url).json(&body))
            .await?;
        let dto: ServiceAccountDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("create service account", e.to_string()))?;
        Ok(dto.into_identity())
    }

    async fn get_service_account(&self, email: &str) -> Result<ServiceIdentity, ProviderError> {
        let url = format!("{}/projects/-/serviceAccounts/{}", IAM_BASE, email);
        let value = self
            .execute("get service account", self.client.get(&url))
            .await?;
        let dto: ServiceAccountDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("get service account", e.to_string()))?;
        Ok(dto.into_identity())
    }

    async fn patch_service_account(
        &self,
        email: &str,
        display_name: &str,
        description: &str,
    ) -> Result<ServiceIdentity, ProviderError> {
        let url = format!("{}/projects/-/serviceAccounts/{}", IAM_BASE, email);
        // Mask limits the patch to mutable fields; the natural key is
        // never part of it.
        let body = json!({
            "serviceAccount": {
                "displayName": display_name,
                "description": description,
            },
            "updateMask": "display_name,description",
        });
        let value = self
            .execute("patch service account", self.client.patch(&url).json(&body))
            .await?;
        let dto: ServiceAccountDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("patch service account", e.to_string()))?;
        Ok(dto.into_identity())
    }

    async fn delete_service_account(&self, email: &str) -> Result<(), ProviderError> {
        let url = format!("{}/projects/-/serviceAccounts/{}", IAM_BASE, email);
        self.execute("delete service account", self.client.delete(&url))
            .await?;
        Ok(())
    }

    async fn get_role(&self, name: &str) -> Result<RoleDefinition, ProviderError> {
        let url = format!("{}/{}", IAM_BASE, name);
        let value = self.execute("get role", self.client.get(&url)).await?;
        let dto: RoleDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("get role", e.to_string()))?;
        Ok(dto.into_definition())
    }

    async fn create_role(
        &self,
        project_id: &str,
        role_id: &str,
        definition: &RoleDefinition,
    ) -> Result<RoleDefinition, ProviderError> {
        let url = format!("{}/projects/{}/roles", IAM_BASE, project_id);
        let body = json!({
            "roleId": role_id,
            "role": {
                "title": definition.title,
                "description": definition.description,
                "includedPermissions": definition.included_permissions,
                "stage": definition.stage,
            }
        });
        let value = self
            .execute("create role", self.client.post(&url).json(&body))
            .await?;
        let dto: RoleDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("create role", e.to_string()))?;
        Ok(dto.into_definition())
    }

    async fn patch_role(
        &self,
        name: &str,
        definition: &RoleDefinition,
    ) -> Result<RoleDefinition, ProviderError> {
        let url = format!(
            "{}/{}?updateMask=title,description,includedPermissions,stage",
            IAM_BASE, name
        );
        let body = json!({
            "title": definition.title,
            "description": definition.description,
            "includedPermissions": definition.included_permissions,
            "stage": definition.stage,
        });
        let value = self
            .execute("patch role", self.client.patch(&url).json(&body))
            .await?;
        let dto: RoleDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("patch role", e.to_string()))?;
        Ok(dto.into_definition())
    }

    async fn delete_role(&self, name: &str) -> Result<(), ProviderError> {
        let url = format!("{}/{}", IAM_BASE, name);
        self.execute("delete role", self.client.delete(&url)).await?;
        Ok(())
    }

    async fn get_iam_policy(&self, project_id: &str) -> Result<PolicyDocument, ProviderError> {
        let url = format!("{}/projects/{}:getIamPolicy", CRM_BASE, project_id);
        let value = self
            .execute("get iam policy", self.client.post(&url).json(&json!({})))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("get iam policy", e.to_string()))
    }

    async fn add_binding(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), ProviderError> {
        let mut policy = self.get_iam_policy(project_id).await?;
        if policy.has_member(role, member) {
            debug!(scope = %project_id, role = %role, "binding already present upstream");
            return Ok(());
        }
        match policy.bindings.iter_mut().find(|b| b.role == role) {
            Some(binding) => {
                binding.members.insert(member.to_string());
            }
            None => policy.bindings.push(PolicyBinding {
                role: role.to_string(),
                members: [member.to_string()].into_iter().collect(),
            }),
        }
        self.set_iam_policy(project_id, &policy).await
    }

    async fn remove_binding(
        &self,
        project_id: &str,
        role: &str,
        member: &str,
    ) -> Result<(), ProviderError> {
        let mut policy = self.get_iam_policy(project_id).await?;
        if !policy.has_member(role, member) {
            return Err(ProviderError::not_found(
                "set iam policy",
                format!("{} is not bound to {} in {}", member, role, project_id),
            ));
        }
        for binding in policy.bindings.iter_mut() {
            if binding.role == role {
                binding.members.remove(member);
            }
        }
        policy.bindings.retain(|b| !b.members.is_empty());
        self.set_iam_policy(project_id, &policy).await
    }

    async fn get_project(&self, project_id: &str) -> Result<ScopeInfo, ProviderError> {
        let url = format!("{}/projects/{}", CRM_BASE, project_id);
        let value = self.execute("get project", self.client.get(&url)).await?;
        let dto: ProjectDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("get project", e.to_string()))?;
        dto.into_scope()
    }

    async fn list_projects(
        &self,
        parent: &str,
        page_token: Option<&str>,
    ) -> Result<ProjectPage, ProviderError> {
        let mut url = format!(
            "{}/projects?parent={}",
            CRM_BASE,
            urlencoding::encode(parent)
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        let value = self.execute("list projects", self.client.get(&url)).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListDto {
            #[serde(default)]
            projects: Vec<ProjectDto>,
            #[serde(default)]
            next_page_token: Option<String>,
        }
        let dto: ListDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("list projects", e.to_string()))?;

        let mut projects = Vec::with_capacity(dto.projects.len());
        for project in dto.projects {
            projects.push(project.into_scope()?);
        }
        Ok(ProjectPage {
            projects,
            next_page_token: dto.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn create_service_account_key(
        &self,
        email: &str,
    ) -> Result<ServiceAccountKey, ProviderError> {
        let url = format!("{}/projects/-/serviceAccounts/{}/keys", IAM_BASE, email);
        let value = self
            .execute(
                "create service account key",
                self.client.post(&url).json(&json!({})),
            )
            .await?;
        let dto: KeyDto = serde_json::from_value(value)
            .map_err(|e| ProviderError::fatal("create service account key", e.to_string()))?;
        dto.into_key()
    }

    async fn delete_service_account_key(&self, key_name: &str) -> Result<(), ProviderError> {
        let url = format!("{}/{}", IAM_BASE, key_name);
        self.execute("delete service account key", self.client.delete(&url))
            .await?;
        Ok(())
    }
}

impl GcpProvider {
    async fn set_iam_policy(
        &self,
        project_id: &str,
        policy: &PolicyDocument,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/projects/{}:setIamPolicy", CRM_BASE, project_id);
        let body = json!({ "policy": policy });
        match self
            .execute("set iam policy", self.client.post(&url).json(&body))
            .await
        {
            Ok(_) => Ok(()),
            // A conflict here is an etag race with a concurrent writer, not
            // a pre-existing resource; retrying re-reads the policy.
            Err(err) if err.is(ErrorKind::AlreadyExists) => Err(ProviderError::transient(
                "set iam policy",
                format!("policy etag conflict in {}", project_id),
            )),
            Err(err) => Err(err),
        }
    }
}

/// Bearer token from the ambient environment: explicit env var, metadata
/// server (workload identity), then the gcloud CLI.
pub async fn fetch_access_token() -> Result<String> {
    if let Ok(token) = env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        if !token.is_empty() {
            info!("using access token from environment");
            return Ok(token);
        }
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let metadata_url =
        "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
    if let Ok(resp) = client
        .get(metadata_url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
    {
        if resp.status().is_success() {
            let data: serde_json::Value = resp.json().await?;
            if let Some(token) = data["access_token"].as_str() {
                info!("using access token from metadata server");
                return Ok(token.to_string());
            }
        }
    }

    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "application-default", "print-access-token"])
        .output()
        .await
        .context("failed to run gcloud CLI")?;
    if !output.status.success() {
        anyhow::bail!(
            "gcloud auth failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::CONFLICT), ErrorKind::AlreadyExists);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorKind::Transient
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorKind::Fatal);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ErrorKind::Fatal);
    }

    #[test]
    fn project_dto_carries_number_and_trial_label() {
        let dto: ProjectDto = serde_json::from_value(json!({
            "name": "projects/1002",
            "projectId": "p2",
            "labels": { "free-trial": "true" }
        }))
        .unwrap();
        let scope = dto.into_scope().unwrap();
        assert_eq!(scope.project_id, "p2");
        assert_eq!(scope.project_number, 1002);
        assert!(scope.free_trial);
    }

    #[test]
    fn malformed_project_name_is_fatal() {
        let dto: ProjectDto = serde_json::from_value(json!({
            "name": "organizations/9",
            "projectId": "p2",
        }))
        .unwrap();
        let err = dto.into_scope().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn key_dto_decodes_material() {
        let dto: KeyDto = serde_json::from_value(json!({
            "name": "projects/-/serviceAccounts/sa/keys/k1",
            "validAfterTime": "2026-01-01T00:00:00Z",
            "validBeforeTime": "2036-01-01T00:00:00Z",
            "privateKeyData": base64::engine::general_purpose::STANDARD.encode("{\"type\":\"service_account\"}"),
        }))
        .unwrap();
        let key = dto.into_key().unwrap();
        assert_eq!(key.name, "projects/-/serviceAccounts/sa/keys/k1");
        assert!(key.private_key.expose().contains("service_account"));
        // Redacted in debug output.
        assert!(!format!("{:?}", key).contains("service_account\""));
    }

    #[test]
    fn service_account_dto_derives_account_id() {
        let dto: ServiceAccountDto = serde_json::from_value(json!({
            "projectId": "p1",
            "email": "fanout-sa@p1.iam.gserviceaccount.com",
            "uniqueId": "100000000000000001",
            "displayName": "Fan-out",
        }))
        .unwrap();
        let identity = dto.into_identity();
        assert_eq!(identity.account_id, "fanout-sa");
        assert_eq!(identity.project_id, "p1");
    }
}

//! Target scope discovery
//!
//! Turns the anchor project plus an optional enclosing container into the
//! ordered set of projects the integration fans out to. The anchor is
//! always a member unless explicitly excluded. Listing pages through all
//! results; a listing failure is fatal for binding-time resolution because
//! binding against a partial membership set would silently shrink the
//! integration, but teardown falls back to the last-known bound set.

use tracing::{debug, info, warn};

use crate::provider::{CloudProvider, ProviderError, ScopeInfo};

/// How sibling projects are discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// No enumeration; the target set is the anchor project alone.
    SingleProject,
    /// Enumerate projects under `folders/{id}`.
    Folder(String),
    /// Enumerate projects under `organizations/{id}`.
    Organization(String),
}

impl Discovery {
    fn parent(&self) -> Option<String> {
        match self {
            Discovery::SingleProject => None,
            Discovery::Folder(id) => Some(format!("folders/{}", id)),
            Discovery::Organization(id) => Some(format!("organizations/{}", id)),
        }
    }
}

/// Exclusion predicates applied to discovered projects.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub projects: std::collections::BTreeSet<String>,
    pub free_trial: bool,
}

impl Exclusions {
    fn excludes(&self, scope: &ScopeInfo) -> bool {
        self.projects.contains(&scope.project_id) || (self.free_trial && scope.free_trial)
    }
}

/// Ordered, de-duplicated set of target scopes; the anchor comes first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: Vec<ScopeInfo>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct a set from the record's parallel id/number lists. Every
    /// project id is kept even if the number list is shorter; silently
    /// dropping one would shrink a teardown over the fallback set.
    pub fn from_known(project_ids: &[String], project_numbers: &[i64]) -> Self {
        if project_ids.len() != project_numbers.len() {
            warn!(
                projects = project_ids.len(),
                numbers = project_numbers.len(),
                "bound project lists have mismatched lengths"
            );
        }
        let mut set = Self::new();
        for (i, id) in project_ids.iter().enumerate() {
            let number = project_numbers.get(i).copied().unwrap_or(0);
            set.push(ScopeInfo::new(id.clone(), number));
        }
        set
    }

    pub fn push(&mut self, scope: ScopeInfo) {
        if !self.contains(&scope.project_id) {
            self.scopes.push(scope);
        }
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.scopes.iter().any(|s| s.project_id == project_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScopeInfo> {
        self.scopes.iter()
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.scopes.iter().map(|s| s.project_id.clone()).collect()
    }

    pub fn project_numbers(&self) -> Vec<i64> {
        self.scopes.iter().map(|s| s.project_number).collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Resolves the concrete target scope set for one integration.
pub struct ScopeResolver<'a, P: CloudProvider> {
    provider: &'a P,
}

impl<'a, P: CloudProvider> ScopeResolver<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    /// Resolve the target set. Any listing error is fatal here.
    pub async fn resolve(
        &self,
        anchor_project: &str,
        discovery: &Discovery,
        exclusions: &Exclusions,
    ) -> Result<ScopeSet, ProviderError> {
        let mut set = ScopeSet::new();

        let anchor = self.provider.get_project(anchor_project).await?;
        if exclusions.excludes(&anchor) {
            debug!(scope = %anchor.project_id, "anchor project explicitly excluded");
        } else {
            set.push(anchor);
        }

        let Some(parent) = discovery.parent() else {
            return Ok(set);
        };

        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .provider
                .list_projects(&parent, page_token.as_deref())
                .await?;
            for project in page.projects {
                if exclusions.excludes(&project) {
                    debug!(scope = %project.project_id, "excluded from target set");
                    continue;
                }
                set.push(project);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        info!(parent = %parent, scopes = set.len(), "resolved target scope set");
        Ok(set)
    }

    /// Teardown-time resolution: discovery may fail precisely because
    /// resources are being deleted concurrently, so fall back to the
    /// last-known bound set instead of aborting.
    pub async fn resolve_or_fallback(
        &self,
        anchor_project: &str,
        discovery: &Discovery,
        exclusions: &Exclusions,
        known_projects: &[String],
        known_numbers: &[i64],
    ) -> ScopeSet {
        match self.resolve(anchor_project, discovery, exclusions).await {
            Ok(set) => set,
            Err(err) => {
                warn!(
                    error = %err,
                    "scope discovery failed, falling back to last-known bound set"
                );
                ScopeSet::from_known(known_projects, known_numbers)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use std::collections::BTreeSet;

    fn org_env() -> FakeProvider {
        FakeProvider::new()
            .with_project(ScopeInfo::new("p1", 1001))
            .with_project(ScopeInfo::new("p2", 1002))
            .with_project(ScopeInfo::new("p3", 1003))
            .with_container("organizations/org-x", &["p1", "p2", "p3"])
    }

    fn excluding(projects: &[&str]) -> Exclusions {
        Exclusions {
            projects: projects.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>(),
            free_trial: false,
        }
    }

    #[tokio::test]
    async fn org_discovery_with_exclusion() {
        let provider = org_env();
        let resolver = ScopeResolver::new(&provider);

        let set = resolver
            .resolve(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &excluding(&["p3"]),
            )
            .await
            .unwrap();

        assert_eq!(set.project_ids(), vec!["p1", "p2"]);
        assert_eq!(set.project_numbers(), vec![1001, 1002]);
    }

    #[tokio::test]
    async fn anchor_always_first_even_when_listed_late() {
        let provider = FakeProvider::new()
            .with_project(ScopeInfo::new("p1", 1001))
            .with_project(ScopeInfo::new("p2", 1002))
            .with_container("organizations/org-x", &["p2", "p1"]);
        let resolver = ScopeResolver::new(&provider);

        let set = resolver
            .resolve(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &Exclusions::default(),
            )
            .await
            .unwrap();

        assert_eq!(set.project_ids(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn free_trial_projects_can_be_excluded() {
        let provider = FakeProvider::new()
            .with_project(ScopeInfo::new("p1", 1001))
            .with_project(ScopeInfo::new("trial", 1009).free_trial())
            .with_container("organizations/org-x", &["p1", "trial"]);
        let resolver = ScopeResolver::new(&provider);

        let exclusions = Exclusions {
            projects: BTreeSet::new(),
            free_trial: true,
        };
        let set = resolver
            .resolve(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &exclusions,
            )
            .await
            .unwrap();

        assert_eq!(set.project_ids(), vec!["p1"]);
    }

    #[tokio::test]
    async fn listing_pages_through_all_results() {
        let provider = org_env().with_page_size(1);
        let resolver = ScopeResolver::new(&provider);

        let set = resolver
            .resolve(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &Exclusions::default(),
            )
            .await
            .unwrap();

        assert_eq!(set.project_ids(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn single_project_mode_is_just_the_anchor() {
        let provider = org_env();
        let resolver = ScopeResolver::new(&provider);

        let set = resolver
            .resolve("p1", &Discovery::SingleProject, &Exclusions::default())
            .await
            .unwrap();
        assert_eq!(set.project_ids(), vec!["p1"]);
    }

    #[tokio::test]
    async fn excluded_anchor_is_omitted() {
        let provider = org_env();
        let resolver = ScopeResolver::new(&provider);

        let set = resolver
            .resolve(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &excluding(&["p1"]),
            )
            .await
            .unwrap();
        assert_eq!(set.project_ids(), vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn listing_failure_is_fatal_for_resolution() {
        let provider = org_env();
        provider.set_fail_listing(true);
        let resolver = ScopeResolver::new(&provider);

        let err = resolver
            .resolve(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &Exclusions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::provider::ErrorKind::Transient);
    }

    #[test]
    fn from_known_keeps_every_project_on_length_mismatch() {
        let set = ScopeSet::from_known(&["p1".to_string(), "p2".to_string()], &[1001]);
        assert_eq!(set.project_ids(), vec!["p1", "p2"]);
        assert_eq!(set.project_numbers(), vec![1001, 0]);
    }

    #[tokio::test]
    async fn teardown_resolution_falls_back_to_known_set() {
        let provider = org_env();
        provider.set_fail_listing(true);
        let resolver = ScopeResolver::new(&provider);

        let known = vec!["p1".to_string(), "p2".to_string()];
        let set = resolver
            .resolve_or_fallback(
                "p1",
                &Discovery::Organization("org-x".to_string()),
                &Exclusions::default(),
                &known,
                &[1001, 1002],
            )
            .await;

        assert_eq!(set.project_ids(), vec!["p1", "p2"]);
        assert_eq!(set.project_numbers(), vec![1001, 1002]);
    }
}

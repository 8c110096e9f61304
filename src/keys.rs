//! Keyed credential lifecycle
//!
//! One active key per identity. Rotation is requested by a change in an
//! opaque externally supplied token; the token's content is never
//! interpreted. There is no atomic swap upstream: rotation deletes the old
//! key and then creates a new one, so a consumer reading in between
//! observes a brief gap. Key material is held in [`SecretMaterial`] and
//! never logged.

use tracing::{debug, info};

use crate::provider::{CloudProvider, ErrorKind, ProviderError, ServiceAccountKey};
use crate::retry::{with_retry, RetryPolicy};

/// Whether a changed rotation token is requesting a new key.
///
/// Absent request token means "no rotation"; any differing value, including
/// the first one ever supplied, requests one.
pub fn rotation_requested(last_seen: Option<&str>, requested: Option<&str>) -> bool {
    match requested {
        None => false,
        Some(token) => last_seen != Some(token),
    }
}

pub struct CredentialRotator<'a, P: CloudProvider> {
    provider: &'a P,
    retry: &'a RetryPolicy,
}

impl<'a, P: CloudProvider> CredentialRotator<'a, P> {
    pub fn new(provider: &'a P, retry: &'a RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Return the existing key, or create one if the identity has none.
    pub async fn ensure(
        &self,
        email: &str,
        existing: Option<&ServiceAccountKey>,
    ) -> Result<ServiceAccountKey, ProviderError> {
        if let Some(key) = existing {
            debug!(identity = %email, key = %key.name, "active key carried through");
            return Ok(key.clone());
        }
        info!(identity = %email, "creating service account key");
        with_retry("create service account key", self.retry, || {
            self.provider.create_service_account_key(email)
        })
        .await
    }

    /// Replace the active key: delete the old one (tolerating a key that is
    /// already gone), then create a new one.
    pub async fn rotate(
        &self,
        email: &str,
        old: Option<&ServiceAccountKey>,
    ) -> Result<ServiceAccountKey, ProviderError> {
        if let Some(old) = old {
            let deleted = with_retry("delete service account key", self.retry, || {
                self.provider.delete_service_account_key(&old.name)
            })
            .await;
            match deleted {
                Ok(()) => info!(identity = %email, key = %old.name, "deleted previous key"),
                Err(err) if err.is(ErrorKind::NotFound) => {
                    debug!(identity = %email, key = %old.name, "previous key already gone")
                }
                Err(err) => return Err(err),
            }
        }

        // A reader between the delete above and this create sees no key.
        let key = with_retry("create service account key", self.retry, || {
            self.provider.create_service_account_key(email)
        })
        .await?;
        info!(identity = %email, key = %key.name, "rotated service account key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;

    const EMAIL: &str = "fanout-sa@p1.iam.gserviceaccount.com";

    fn retry() -> RetryPolicy {
        RetryPolicy::immediate()
    }

    #[test]
    fn rotation_token_semantics() {
        assert!(!rotation_requested(None, None));
        assert!(!rotation_requested(Some("v1"), None));
        assert!(!rotation_requested(Some("v1"), Some("v1")));
        assert!(rotation_requested(None, Some("v1")));
        assert!(rotation_requested(Some("v1"), Some("v2")));
    }

    #[tokio::test]
    async fn ensure_creates_only_when_missing() {
        let provider = FakeProvider::new();
        let retry = retry();
        let rotator = CredentialRotator::new(&provider, &retry);

        let key = rotator.ensure(EMAIL, None).await.unwrap();
        assert_eq!(provider.key_count(), 1);

        let same = rotator.ensure(EMAIL, Some(&key)).await.unwrap();
        assert_eq!(same, key);
        assert_eq!(provider.key_count(), 1);
    }

    #[tokio::test]
    async fn rotate_replaces_key_with_later_validity() {
        let provider = FakeProvider::new();
        let retry = retry();
        let rotator = CredentialRotator::new(&provider, &retry);

        let old = rotator.ensure(EMAIL, None).await.unwrap();
        let new = rotator.rotate(EMAIL, Some(&old)).await.unwrap();

        assert_ne!(new.name, old.name);
        assert!(new.valid_after > old.valid_after);
        assert_ne!(new.private_key.expose(), old.private_key.expose());
        // Exactly one key remains active.
        assert_eq!(provider.key_count(), 1);
    }

    #[tokio::test]
    async fn rotate_tolerates_missing_old_key() {
        let provider = FakeProvider::new();
        let retry = retry();
        let rotator = CredentialRotator::new(&provider, &retry);

        let old = rotator.ensure(EMAIL, None).await.unwrap();
        provider.delete_service_account_key(&old.name).await.unwrap();

        let new = rotator.rotate(EMAIL, Some(&old)).await.unwrap();
        assert_ne!(new.name, old.name);
        assert_eq!(provider.key_count(), 1);
    }
}

//! Match aggregation and the access broker that turns matches into
//! short-lived signed URLs.

use crate::error::PipelineError;
use crate::Collaborators;
use smriti_core::{
    AccessHandle, MatchResult, RawHit, RetryPolicy, ServiceError, SessionId, Tenant,
};
use smriti_services::{ObjectStorage, RelationalStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct AccessBroker {
    store: Arc<dyn RelationalStore>,
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
}

impl AccessBroker {
    pub fn new(collab: &Collaborators, retry: RetryPolicy) -> Self {
        Self {
            store: collab.store.clone(),
            storage: collab.storage.clone(),
            retry,
        }
    }

    /// Collapse raw hits into one ranked match per photo.
    pub fn aggregate(&self, session_id: SessionId, hits: &[RawHit]) -> Vec<MatchResult> {
        smriti_core::aggregate(session_id, hits)
    }

    /// Issue one signed URL per distinct matched photo, in rank order.
    ///
    /// Every photo is looked up within `tenant` and its key must sit under
    /// the tenant's storage prefix; anything else is a
    /// [`PipelineError::TenantIsolationViolation`]. Photos whose object has
    /// vanished from storage are skipped. Handles are minted fresh on each
    /// call and expire after `ttl`.
    pub async fn grant_access(
        &self,
        tenant: &Tenant,
        matches: &[MatchResult],
        ttl: Duration,
    ) -> Result<Vec<AccessHandle>, PipelineError> {
        if ttl.is_zero() {
            return Err(PipelineError::InvalidInput("access ttl must be positive".into()));
        }

        let mut ranked: Vec<&MatchResult> = matches.iter().collect();
        ranked.sort_by_key(|m| m.rank);

        let mut granted = HashSet::new();
        let mut handles = Vec::with_capacity(ranked.len());
        for m in ranked {
            if !granted.insert(m.photo_asset_id) {
                continue;
            }

            let photo = self
                .retry
                .run("photo", || self.store.photo(tenant.id, m.photo_asset_id))
                .await
                .map_err(|a| PipelineError::from_attempt("photo", a))?
                .ok_or_else(|| {
                    PipelineError::TenantIsolationViolation(format!(
                        "photo {} is not owned by tenant {}",
                        m.photo_asset_id, tenant.id
                    ))
                })?;
            let key = tenant.relative_key(&photo.storage_key).ok_or_else(|| {
                PipelineError::TenantIsolationViolation(format!(
                    "photo {} key {:?} outside prefix {:?}",
                    photo.id, photo.storage_key, tenant.storage_prefix
                ))
            })?;

            let signed = match self
                .retry
                .run("issue_signed_url", || {
                    self.storage
                        .issue_signed_url(&tenant.storage_prefix, key, ttl)
                })
                .await
            {
                Ok(signed) => signed,
                Err(a) if matches!(a.error, ServiceError::NotFound(_)) => {
                    tracing::warn!(photo = photo.id, key = %photo.storage_key, "object missing; no handle issued");
                    continue;
                }
                Err(a) => return Err(PipelineError::from_attempt("issue_signed_url", a)),
            };

            handles.push(AccessHandle {
                photo_asset_id: photo.id,
                storage_key: photo.storage_key,
                signed_url: signed.url,
                expires_at: signed.expires_at,
            });
        }

        tracing::info!(tenant = tenant.id, handles = handles.len(), ttl_secs = ttl.as_secs(), "access granted");
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::testutil::Harness;

    fn match_for(session: SessionId, photo: i64, rank: usize) -> MatchResult {
        MatchResult {
            search_session_id: session,
            photo_asset_id: photo,
            confidence: 95.0,
            rank,
        }
    }

    #[tokio::test]
    async fn test_grant_in_rank_order() {
        let h = Harness::new().await;
        let (t, photos) = h
            .tenant_with_photos(
                "host@example.com",
                &[("a.jpg", b"a", &[]), ("b.jpg", b"b", &[]), ("c.jpg", b"c", &[])],
            )
            .await;
        let session = uuid::Uuid::new_v4();
        let hits = [
            RawHit { photo_asset_id: photos[0].id, confidence: 91.0 },
            RawHit { photo_asset_id: photos[2].id, confidence: 99.0 },
            RawHit { photo_asset_id: photos[0].id, confidence: 93.0 },
        ];
        let matches = h.pipeline.access.aggregate(session, &hits);
        let handles = h
            .pipeline
            .access
            .grant_access(&t, &matches, Duration::from_secs(60))
            .await
            .unwrap();

        let ids: Vec<_> = handles.iter().map(|h| h.photo_asset_id).collect();
        assert_eq!(ids, vec![photos[2].id, photos[0].id]);
        for handle in &handles {
            assert!(handle.storage_key.starts_with(&t.storage_prefix));
            assert!(!handle.is_expired(Utc::now()));
            let bytes = h.storage.fetch_signed(&handle.signed_url).await.unwrap();
            assert!(!bytes.is_empty());
        }
    }

    #[tokio::test]
    async fn test_foreign_photo_refused() {
        let h = Harness::new().await;
        let (_a, photos_a) = h
            .tenant_with_photos("a@example.com", &[("a.jpg", b"a", &[])])
            .await;
        let b = h.pipeline.registry.provision("b@example.com").await.unwrap();
        let session = uuid::Uuid::new_v4();

        let err = h
            .pipeline
            .access
            .grant_access(&b, &[match_for(session, photos_a[0].id, 1)], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TenantIsolationViolation(_)));
    }

    #[tokio::test]
    async fn test_missing_object_skipped() {
        let h = Harness::new().await;
        let (t, photos) = h
            .tenant_with_photos("host@example.com", &[("a.jpg", b"a", &[])])
            .await;
        let ghost = h
            .store
            .upsert_photo(t.id, &format!("{}/ghost.jpg", t.storage_prefix))
            .await
            .unwrap();
        let session = uuid::Uuid::new_v4();
        let matches = [match_for(session, ghost.id, 1), match_for(session, photos[0].id, 2)];

        let handles = h
            .pipeline
            .access
            .grant_access(&t, &matches, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].photo_asset_id, photos[0].id);
    }

    #[tokio::test]
    async fn test_handles_not_reused() {
        let h = Harness::new().await;
        let (t, photos) = h
            .tenant_with_photos("host@example.com", &[("a.jpg", b"a", &[])])
            .await;
        let matches = [match_for(uuid::Uuid::new_v4(), photos[0].id, 1)];
        let first = h
            .pipeline
            .access
            .grant_access(&t, &matches, Duration::from_secs(60))
            .await
            .unwrap();
        let second = h
            .pipeline
            .access
            .grant_access(&t, &matches, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(second[0].expires_at > first[0].expires_at);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let h = Harness::new().await;
        let t = h.pipeline.registry.provision("host@example.com").await.unwrap();
        assert!(matches!(
            h.pipeline.access.grant_access(&t, &[], Duration::ZERO).await,
            Err(PipelineError::InvalidInput(_))
        ));
    }
}

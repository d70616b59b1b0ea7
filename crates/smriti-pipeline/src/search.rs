//! Search Orchestrator: runs a guest's selfie against one tenant's
//! collection and resolves matched faces to that tenant's photos.

use crate::error::PipelineError;
use crate::Collaborators;
use smriti_core::{IndexStatus, RawHit, RetryPolicy, ServiceError, Tenant, Throttle};
use smriti_services::{FaceRecognition, RelationalStore, SearchResponse};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct SearchOrchestrator {
    recognition: Arc<dyn FaceRecognition>,
    store: Arc<dyn RelationalStore>,
    retry: RetryPolicy,
    throttle: Arc<Throttle>,
    threshold: f32,
    max_results: usize,
}

impl SearchOrchestrator {
    pub fn new(
        collab: &Collaborators,
        retry: RetryPolicy,
        throttle: Arc<Throttle>,
        threshold: f32,
        max_results: usize,
    ) -> Self {
        Self {
            recognition: collab.recognition.clone(),
            store: collab.store.clone(),
            retry,
            throttle,
            threshold,
            max_results: max_results.max(1),
        }
    }

    /// Search `tenant`'s collection for faces matching the probe.
    ///
    /// Returns one raw hit per matched face; a photo showing the guest
    /// several times may appear more than once. Hits are unordered and
    /// only ever reference photos owned by `tenant`.
    pub async fn search(&self, tenant: &Tenant, probe: &[u8]) -> Result<Vec<RawHit>, PipelineError> {
        if probe.is_empty() {
            return Err(PipelineError::InvalidInput("empty probe image".into()));
        }

        let face_hits = self.collect_faces(tenant, probe).await?;
        if face_hits.is_empty() {
            tracing::info!(tenant = tenant.id, "search found no faces");
            return Ok(Vec::new());
        }

        let ids: Vec<String> = face_hits.iter().map(|(id, _)| id.clone()).collect();
        let owners = self
            .retry
            .run("face_owners", || self.store.face_owners(ids.clone()))
            .await
            .map_err(|a| PipelineError::from_attempt("face_owners", a))?;
        let owners: HashMap<&str, _> = owners.iter().map(|o| (o.face_id.as_str(), o)).collect();

        let mut hits = Vec::with_capacity(face_hits.len());
        for (face_id, confidence) in &face_hits {
            let Some(owner) = owners.get(face_id.as_str()) else {
                tracing::warn!(tenant = tenant.id, face = %face_id, "face id has no photo record; dropping");
                continue;
            };
            if owner.tenant_id != tenant.id {
                tracing::error!(
                    tenant = tenant.id,
                    owner = owner.tenant_id,
                    face = %face_id,
                    "search hit resolved to another tenant"
                );
                return Err(PipelineError::TenantIsolationViolation(format!(
                    "face {face_id} belongs to tenant {}, searched tenant {}",
                    owner.tenant_id, tenant.id
                )));
            }
            if owner.status != IndexStatus::Indexed {
                tracing::debug!(photo = owner.photo_asset_id, status = owner.status.as_str(), "photo not searchable");
                continue;
            }
            hits.push(RawHit {
                photo_asset_id: owner.photo_asset_id,
                confidence: *confidence,
            });
        }

        tracing::info!(tenant = tenant.id, faces = face_hits.len(), hits = hits.len(), "search finished");
        Ok(hits)
    }

    /// Page through the recognition search, keeping `(face_id, confidence)`
    /// pairs at or above the threshold, up to `max_results`.
    async fn collect_faces(
        &self,
        tenant: &Tenant,
        probe: &[u8],
    ) -> Result<Vec<(String, f32)>, PipelineError> {
        let recognition = &self.recognition;
        let throttle = &self.throttle;
        let collection = tenant.collection_id.as_str();
        let threshold = self.threshold;
        let quota_pause = self.retry.max_delay;

        let mut faces = Vec::new();
        let mut seen_faces = HashSet::new();
        let mut seen_tokens = HashSet::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page_token = token.as_deref();
            let response = self
                .retry
                .run("search_faces", || async move {
                    throttle.acquire().await;
                    let r = recognition
                        .search_faces(collection, probe, threshold, page_token)
                        .await;
                    if matches!(r, Err(ServiceError::QuotaExceeded(_))) {
                        throttle.pause(quota_pause).await;
                    }
                    r
                })
                .await
                .map_err(|a| PipelineError::from_attempt("search_faces", a))?;
            pages += 1;

            let page = match response {
                SearchResponse::NoFaceInProbe if pages == 1 => {
                    tracing::info!(tenant = tenant.id, "no face in probe");
                    return Err(PipelineError::NoFaceInProbe);
                }
                SearchResponse::NoFaceInProbe => {
                    tracing::warn!(tenant = tenant.id, pages, "probe lost its face mid-search; stopping");
                    break;
                }
                SearchResponse::Page(page) => page,
            };

            for hit in page.hits {
                if hit.confidence.is_nan() || hit.confidence < threshold {
                    continue;
                }
                if seen_faces.insert(hit.face_id.clone()) {
                    faces.push((hit.face_id, hit.confidence));
                }
                if faces.len() >= self.max_results {
                    break;
                }
            }
            if faces.len() >= self.max_results {
                tracing::info!(tenant = tenant.id, max = self.max_results, "result cap reached");
                break;
            }

            match page.next_token {
                None => break,
                Some(next) => {
                    if !seen_tokens.insert(next.clone()) {
                        tracing::warn!(tenant = tenant.id, token = %next, "continuation token repeated; stopping");
                        break;
                    }
                    token = Some(next);
                }
            }
        }

        tracing::debug!(tenant = tenant.id, pages, faces = faces.len(), "search pages collected");
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, Harness};
    use smriti_services::{MemoryRecognition, NewTenant, RecognitionOp};

    const SELFIE: &[u8] = b"selfie-alice";

    async fn wedding(h: &Harness) -> (Tenant, Vec<smriti_core::PhotoAsset>) {
        h.recognition.register_image(SELFIE, &[("alice", 99.0)]);
        h.indexed_tenant(
            "host@example.com",
            &[
                ("p1.jpg", b"p1", &[("alice", 95.0)]),
                ("p2.jpg", b"p2", &[("alice", 91.0), ("bob", 97.0)]),
                ("p3.jpg", b"p3", &[("bob", 96.0)]),
            ],
        )
        .await
    }

    #[tokio::test]
    async fn test_search_finds_guest_photos() {
        let h = Harness::new().await;
        let (t, photos) = wedding(&h).await;

        let mut hits = h.pipeline.search.search(&t, SELFIE).await.unwrap();
        hits.sort_by_key(|hit| hit.photo_asset_id);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].photo_asset_id, photos[0].id);
        assert_eq!(hits[0].confidence, 95.0);
        assert_eq!(hits[1].photo_asset_id, photos[1].id);
        assert_eq!(hits[1].confidence, 91.0);
    }

    #[tokio::test]
    async fn test_below_threshold_excluded() {
        let h = Harness::new().await;
        h.recognition.register_image(SELFIE, &[("alice", 99.0)]);
        let (t, _) = h
            .indexed_tenant("host@example.com", &[("blur.jpg", b"blur", &[("alice", 85.0)])])
            .await;
        assert!(h.pipeline.search.search(&t, SELFIE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_face_in_probe() {
        let h = Harness::new().await;
        let (t, _) = wedding(&h).await;
        let err = h.pipeline.search.search(&t, b"landscape").await.unwrap_err();
        assert!(matches!(err, PipelineError::NoFaceInProbe));
    }

    #[tokio::test]
    async fn test_empty_probe_rejected() {
        let h = Harness::new().await;
        let (t, _) = wedding(&h).await;
        assert!(matches!(
            h.pipeline.search.search(&t, b"").await,
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_search_follows_pages() {
        let h = Harness::build(test_config(), MemoryRecognition::new(2)).await;
        h.recognition.register_image(SELFIE, &[("alice", 99.0)]);
        let (t, _) = h
            .indexed_tenant(
                "host@example.com",
                &[
                    ("1.jpg", b"1", &[("alice", 91.0)]),
                    ("2.jpg", b"2", &[("alice", 92.0)]),
                    ("3.jpg", b"3", &[("alice", 93.0)]),
                    ("4.jpg", b"4", &[("alice", 94.0)]),
                    ("5.jpg", b"5", &[("alice", 95.0)]),
                ],
            )
            .await;
        let hits = h.pipeline.search.search(&t, SELFIE).await.unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(h.recognition.calls(RecognitionOp::SearchFaces), 3);
    }

    #[tokio::test]
    async fn test_max_results_caps_hits() {
        let mut cfg = test_config();
        cfg.max_results = 3;
        let h = Harness::build(cfg, MemoryRecognition::new(2)).await;
        h.recognition.register_image(SELFIE, &[("alice", 99.0)]);
        let (t, _) = h
            .indexed_tenant(
                "host@example.com",
                &[
                    ("1.jpg", b"1", &[("alice", 91.0)]),
                    ("2.jpg", b"2", &[("alice", 92.0)]),
                    ("3.jpg", b"3", &[("alice", 93.0)]),
                    ("4.jpg", b"4", &[("alice", 94.0)]),
                    ("5.jpg", b"5", &[("alice", 95.0)]),
                ],
            )
            .await;
        let hits = h.pipeline.search.search(&t, SELFIE).await.unwrap();
        assert_eq!(hits.len(), 3);
        // Highest-confidence pages come first.
        assert!(hits.iter().all(|hit| hit.confidence >= 93.0));
    }

    #[tokio::test]
    async fn test_transient_search_failure_retried() {
        let h = Harness::new().await;
        let (t, _) = wedding(&h).await;
        h.recognition.fail_next(
            RecognitionOp::SearchFaces,
            [ServiceError::Transient("503".into())],
        );
        assert_eq!(h.pipeline.search.search(&t, SELFIE).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_stays_inside_tenant() {
        let h = Harness::new().await;
        let (a, photos_a) = wedding(&h).await;
        let (b, photos_b) = h
            .indexed_tenant("other@example.com", &[("b1.jpg", b"b1", &[("alice", 98.0)])])
            .await;

        let hits_b = h.pipeline.search.search(&b, SELFIE).await.unwrap();
        assert_eq!(hits_b.len(), 1);
        assert_eq!(hits_b[0].photo_asset_id, photos_b[0].id);

        let hits_a = h.pipeline.search.search(&a, SELFIE).await.unwrap();
        let ids_a: HashSet<_> = photos_a.iter().map(|p| p.id).collect();
        assert!(hits_a.iter().all(|hit| ids_a.contains(&hit.photo_asset_id)));
    }

    #[tokio::test]
    async fn test_shared_collection_is_isolation_violation() {
        let h = Harness::new().await;
        let (a, _) = wedding(&h).await;
        let intruder = h
            .store
            .insert_tenant(NewTenant {
                email: "intruder@example.com".into(),
                passkey: "smriti_user_deadbeef".into(),
                client_passkey: "smriti_client_deadbeef".into(),
                storage_prefix: "Wedding_images/intruder".into(),
                collection_id: a.collection_id.clone(),
            })
            .await
            .unwrap();
        let err = h.pipeline.search.search(&intruder, SELFIE).await.unwrap_err();
        assert!(matches!(err, PipelineError::TenantIsolationViolation(_)));
    }

    #[tokio::test]
    async fn test_unknown_face_dropped() {
        let h = Harness::new().await;
        let (t, _) = wedding(&h).await;
        h.recognition.register_image(b"stray", &[("alice", 97.0)]);
        h.recognition
            .index_faces(&t.collection_id, b"stray", "999999")
            .await
            .unwrap();
        let hits = h.pipeline.search.search(&t, SELFIE).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_two_photos_of_one_face_rank_by_confidence() {
        let mut cfg = test_config();
        cfg.confidence_threshold = 80.0;
        let h = Harness::with_config(cfg).await;
        h.recognition.register_image(SELFIE, &[("alice", 99.0)]);
        let (t, photos) = h
            .indexed_tenant(
                "host@example.com",
                &[
                    ("low.jpg", b"low", &[("alice", 87.0)]),
                    ("high.jpg", b"high", &[("alice", 91.0)]),
                    ("other.jpg", b"other", &[("bob", 95.0)]),
                ],
            )
            .await;

        let hits = h.pipeline.search.search(&t, SELFIE).await.unwrap();
        let matches = h.pipeline.access.aggregate(uuid::Uuid::new_v4(), &hits);
        let ranked: Vec<_> = matches.iter().map(|m| (m.photo_asset_id, m.confidence, m.rank)).collect();
        assert_eq!(ranked, [(photos[1].id, 91.0, 1), (photos[0].id, 87.0, 2)]);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let h = Harness::new().await;
        h.recognition.register_image(SELFIE, &[("alice", 99.0)]);
        let t = h.pipeline.registry.provision("host@example.com").await.unwrap();
        assert!(h.pipeline.search.search(&t, SELFIE).await.unwrap().is_empty());
    }
}

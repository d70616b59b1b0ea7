//! Collection Indexer: uploads photos into the tenant's storage prefix and
//! pushes them into the tenant's face collection in bounded batches.

use crate::error::PipelineError;
use crate::Collaborators;
use smriti_core::{
    Attempted, IndexOutcome, IndexStatus, PhotoAsset, PhotoId, RetryPolicy, ServiceError, Tenant,
    Throttle,
};
use smriti_services::{FaceIndexResponse, FaceRecognition, ObjectStorage, RelationalStore};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// File extensions accepted for upload (lowercase).
pub const ACCEPTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "raw", "cr2", "dng", "nef", "tif", "tiff", "webp",
];

/// Suffixed names tried after the original file name is taken.
const MAX_RENAMES: u32 = 5;

pub struct CollectionIndexer {
    storage: Arc<dyn ObjectStorage>,
    recognition: Arc<dyn FaceRecognition>,
    store: Arc<dyn RelationalStore>,
    retry: RetryPolicy,
    throttle: Arc<Throttle>,
    batch_size: usize,
    parallelism: usize,
}

/// Everything one indexing task needs; cloned into each spawned task.
#[derive(Clone)]
struct ItemContext {
    storage: Arc<dyn ObjectStorage>,
    recognition: Arc<dyn FaceRecognition>,
    store: Arc<dyn RelationalStore>,
    retry: RetryPolicy,
    throttle: Arc<Throttle>,
    tenant: Arc<Tenant>,
    quota_hit: Arc<AtomicBool>,
}

impl CollectionIndexer {
    pub fn new(
        collab: &Collaborators,
        retry: RetryPolicy,
        throttle: Arc<Throttle>,
        batch_size: usize,
        parallelism: usize,
    ) -> Self {
        Self {
            storage: collab.storage.clone(),
            recognition: collab.recognition.clone(),
            store: collab.store.clone(),
            retry,
            throttle,
            batch_size: batch_size.max(1),
            parallelism: parallelism.max(1),
        }
    }

    /// Store a new photo under the tenant's prefix and register it as pending.
    ///
    /// An existing object with the same name is never overwritten; the new
    /// one gets a `-<6 hex>` suffix instead. Storage creates objects
    /// exclusively, so concurrent uploads of one name also end up apart.
    pub async fn upload(
        &self,
        tenant: &Tenant,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<PhotoAsset, PipelineError> {
        let name = filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, ext),
            _ => {
                return Err(PipelineError::InvalidInput(format!(
                    "file name without extension: {filename:?}"
                )))
            }
        };
        if !ACCEPTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return Err(PipelineError::InvalidInput(format!(
                "unsupported file type: {ext:?}"
            )));
        }
        if bytes.is_empty() {
            return Err(PipelineError::InvalidInput(format!("empty file: {name:?}")));
        }

        let prefix = tenant.storage_prefix.as_str();
        let mut key = name.to_string();
        let mut renames = 0;
        loop {
            let put = self
                .retry
                .run("put", || self.storage.put(prefix, &key, bytes.clone()))
                .await;
            match put {
                Ok(()) => break,
                Err(a) if matches!(a.error, ServiceError::Conflict(_)) && renames < MAX_RENAMES => {
                    renames += 1;
                    let mut suffix = uuid::Uuid::new_v4().simple().to_string();
                    suffix.truncate(6);
                    key = format!("{stem}-{suffix}.{ext}");
                    tracing::debug!(tenant = tenant.id, key = %key, "name taken; trying suffixed name");
                }
                Err(a) => return Err(PipelineError::from_attempt("put", a)),
            }
        }

        let storage_key = format!("{prefix}/{key}");
        let photo = self
            .retry
            .run("upsert_photo", || self.store.upsert_photo(tenant.id, &storage_key))
            .await
            .map_err(|a| PipelineError::from_attempt("upsert_photo", a))?;
        tracing::info!(tenant = tenant.id, photo = photo.id, key = %storage_key, "photo uploaded");
        Ok(photo)
    }

    pub async fn photos(&self, tenant: &Tenant) -> Result<Vec<PhotoAsset>, PipelineError> {
        self.retry
            .run("photos", || self.store.photos(tenant.id))
            .await
            .map_err(|a| PipelineError::from_attempt("photos", a))
    }

    /// Photos the organizer picked for the guest slideshow.
    pub async fn highlights(&self, tenant: &Tenant) -> Result<Vec<PhotoAsset>, PipelineError> {
        Ok(self
            .photos(tenant)
            .await?
            .into_iter()
            .filter(|p| p.is_highlight)
            .collect())
    }

    pub async fn toggle_highlight(
        &self,
        tenant: &Tenant,
        storage_key: &str,
    ) -> Result<PhotoAsset, PipelineError> {
        if !tenant.owns_key(storage_key) {
            return Err(PipelineError::TenantIsolationViolation(format!(
                "key {storage_key:?} outside tenant {} prefix",
                tenant.id
            )));
        }
        self.retry
            .run("toggle_highlight", || {
                self.store.toggle_highlight(tenant.id, storage_key)
            })
            .await
            .map_err(|a| PipelineError::from_attempt("toggle_highlight", a))
    }

    /// Index every photo of the tenant still waiting for ingestion.
    pub async fn index_pending(&self, tenant: &Tenant) -> Result<Vec<IndexOutcome>, PipelineError> {
        let pending: Vec<PhotoAsset> = self
            .photos(tenant)
            .await?
            .into_iter()
            .filter(|p| p.status == IndexStatus::Pending)
            .collect();
        self.index(tenant, &pending).await
    }

    /// Push photos into the tenant's face collection.
    ///
    /// Returns one outcome per distinct photo, in input order. Per-photo
    /// failures are reported as outcomes; only collaborator-wide failures
    /// (missing collection, store unavailable before any work) and tenant
    /// isolation violations abort the run.
    pub async fn index(
        &self,
        tenant: &Tenant,
        photos: &[PhotoAsset],
    ) -> Result<Vec<IndexOutcome>, PipelineError> {
        let mut seen = HashSet::new();
        let mut distinct = Vec::with_capacity(photos.len());
        for photo in photos {
            if photo.tenant_id != tenant.id || !tenant.owns_key(&photo.storage_key) {
                return Err(PipelineError::TenantIsolationViolation(format!(
                    "photo {} is not owned by tenant {}",
                    photo.id, tenant.id
                )));
            }
            if seen.insert(photo.id) {
                distinct.push(photo.clone());
            }
        }

        let ctx = ItemContext {
            storage: self.storage.clone(),
            recognition: self.recognition.clone(),
            store: self.store.clone(),
            retry: self.retry,
            throttle: self.throttle.clone(),
            tenant: Arc::new(tenant.clone()),
            quota_hit: Arc::new(AtomicBool::new(false)),
        };

        let mut outcomes = Vec::with_capacity(distinct.len());
        let mut batch_size = self.batch_size;
        let mut remaining = distinct.as_slice();
        let mut batch_no = 0usize;

        while !remaining.is_empty() {
            let take = batch_size.min(remaining.len());
            let (batch, rest) = remaining.split_at(take);
            remaining = rest;
            batch_no += 1;

            tracing::debug!(tenant = tenant.id, batch = batch_no, size = batch.len(), "indexing batch");
            ctx.quota_hit.store(false, Ordering::SeqCst);
            outcomes.extend(self.run_batch(&ctx, batch).await?);

            if ctx.quota_hit.load(Ordering::SeqCst) && batch_size > 1 {
                batch_size = (batch_size / 2).max(1);
                tracing::warn!(tenant = tenant.id, batch_size, "quota exceeded; shrinking batch");
            }
        }

        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        tracing::info!(
            tenant = tenant.id,
            photos = outcomes.len(),
            failed,
            "indexing finished"
        );
        Ok(outcomes)
    }

    async fn run_batch(
        &self,
        ctx: &ItemContext,
        batch: &[PhotoAsset],
    ) -> Result<Vec<IndexOutcome>, PipelineError> {
        let permits = Arc::new(Semaphore::new(self.parallelism));
        let mut set = JoinSet::new();

        for (pos, photo) in batch.iter().cloned().enumerate() {
            let ctx = ctx.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| PipelineError::InvalidInput("indexing cancelled".into()))?;
                index_one(&ctx, photo).await.map(|o| (pos, o))
            });
        }

        let mut slots: Vec<Option<IndexOutcome>> = vec![None; batch.len()];
        while let Some(joined) = set.join_next().await {
            let (pos, outcome) = joined.map_err(|e| {
                PipelineError::Io(std::io::Error::other(format!("indexing task failed: {e}")))
            })??;
            slots[pos] = Some(outcome);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// Index a single photo. `Err` means the whole run must stop.
async fn index_one(ctx: &ItemContext, photo: PhotoAsset) -> Result<IndexOutcome, PipelineError> {
    let tenant = ctx.tenant.as_ref();

    let existing = ctx
        .retry
        .run("face_record", || ctx.store.face_record(photo.id))
        .await
        .map_err(|a| PipelineError::from_attempt("face_record", a))?;
    if let Some(record) = existing {
        tracing::debug!(photo = photo.id, "already indexed; skipping");
        return Ok(IndexOutcome::AlreadyIndexed {
            photo_asset_id: photo.id,
            face_ids: record.face_ids,
        });
    }

    let key = tenant.relative_key(&photo.storage_key).ok_or_else(|| {
        PipelineError::TenantIsolationViolation(format!("photo {} key outside prefix", photo.id))
    })?;

    let image = match ctx
        .retry
        .run("get", || ctx.storage.get(&tenant.storage_prefix, key))
        .await
    {
        Ok(bytes) => bytes,
        Err(a) => return failed(ctx, photo.id, "get", a).await,
    };

    let external_id = photo.id.to_string();
    let response = ctx
        .retry
        .run("index_faces", || {
            let ctx = ctx.clone();
            let image = &image;
            let external_id = &external_id;
            async move {
                ctx.throttle.acquire().await;
                let r = ingest(&ctx, image, external_id).await;
                if matches!(r, Err(ServiceError::QuotaExceeded(_))) {
                    ctx.quota_hit.store(true, Ordering::SeqCst);
                    ctx.throttle.pause(ctx.retry.max_delay).await;
                }
                r
            }
        })
        .await;
    drop(image);

    let face_ids: BTreeSet<String> = match response {
        Ok(FaceIndexResponse::Faces(ids)) => ids.into_iter().collect(),
        Ok(FaceIndexResponse::NoFace) => BTreeSet::new(),
        Err(a) if matches!(a.error, ServiceError::NotFound(_)) => {
            tracing::error!(
                tenant = tenant.id,
                collection = %tenant.collection_id,
                "face collection missing; aborting indexing"
            );
            return Err(PipelineError::from_attempt("index_faces", a));
        }
        Err(a) => return failed(ctx, photo.id, "index_faces", a).await,
    };

    let record = match ctx
        .retry
        .run("record_faces", || ctx.store.record_faces(photo.id, face_ids.clone()))
        .await
    {
        Ok(r) => r,
        Err(a) => return failed(ctx, photo.id, "record_faces", a).await,
    };

    if record.face_ids.is_empty() {
        tracing::debug!(photo = photo.id, "no face detected");
        Ok(IndexOutcome::NoFaceDetected {
            photo_asset_id: photo.id,
        })
    } else {
        tracing::debug!(photo = photo.id, faces = record.face_ids.len(), "indexed");
        Ok(IndexOutcome::Indexed {
            photo_asset_id: photo.id,
            face_ids: record.face_ids,
        })
    }
}

/// Push one image into the collection, first removing any faces an earlier
/// attempt left under the same external id. A reply lost after the service
/// applied the call therefore never leaves two entries for one photo.
async fn ingest(
    ctx: &ItemContext,
    image: &[u8],
    external_id: &str,
) -> Result<FaceIndexResponse, ServiceError> {
    let collection = ctx.tenant.collection_id.as_str();
    let stale = ctx.recognition.list_faces(collection, external_id).await?;
    if !stale.is_empty() {
        let removed = ctx.recognition.delete_faces(collection, &stale).await?;
        tracing::warn!(
            tenant = ctx.tenant.id,
            photo = external_id,
            removed,
            "purged faces left by an earlier attempt"
        );
    }
    ctx.recognition.index_faces(collection, image, external_id).await
}

async fn failed(
    ctx: &ItemContext,
    photo_id: PhotoId,
    op: &str,
    attempted: Attempted,
) -> Result<IndexOutcome, PipelineError> {
    tracing::warn!(
        photo = photo_id,
        op,
        attempts = attempted.attempts,
        error = %attempted.error,
        "photo failed permanently"
    );
    if let Err(err) = ctx.store.mark_failed(photo_id).await {
        tracing::warn!(photo = photo_id, error = %err, "could not record failed status");
    }
    Ok(IndexOutcome::FailedPermanently {
        photo_asset_id: photo_id,
        attempts: attempted.attempts,
        reason: format!("{op}: {}", attempted.error),
    })
}

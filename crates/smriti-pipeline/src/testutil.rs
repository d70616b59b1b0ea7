//! In-memory pipeline wiring shared by the unit tests.

use crate::{Collaborators, Pipeline, PipelineConfig};
use async_trait::async_trait;
use smriti_core::{FaceIndexRecord, PhotoAsset, PhotoId, ServiceError, Tenant, TenantId};
use smriti_services::{
    FaceIndexResponse, FaceOwner, FaceRecognition, MemoryMailer, MemoryRecognition, MemoryStorage,
    NewTenant, RelationalStore, SearchResponse, SqliteStore,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub struct Harness {
    pub pipeline: Pipeline,
    pub storage: Arc<MemoryStorage>,
    pub recognition: Arc<MemoryRecognition>,
    pub store: Arc<SqliteStore>,
    pub mailer: Arc<MemoryMailer>,
}

/// Fast retries, no throttling, three attempts.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        signing_key: "test-signing-key".to_string(),
        max_attempts: 3,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        call_timeout_ms: 2000,
        requests_per_second: 0,
        confidence_threshold: 90.0,
        ..PipelineConfig::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: PipelineConfig) -> Self {
        Self::build(config, MemoryRecognition::default()).await
    }

    pub async fn build(config: PipelineConfig, recognition: MemoryRecognition) -> Self {
        Self::build_with(config, recognition, |collab| collab).await
    }

    /// Like [`Harness::build`], but lets the test wrap collaborators before
    /// the pipeline sees them. The harness fields keep the unwrapped ones.
    pub async fn build_with(
        config: PipelineConfig,
        recognition: MemoryRecognition,
        wrap: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new(&config.signing_key));
        let recognition = Arc::new(recognition);
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let mailer = Arc::new(MemoryMailer::default());

        let collab = Collaborators {
            storage: storage.clone(),
            recognition: recognition.clone(),
            store: store.clone(),
            mailer: mailer.clone(),
        };
        Self {
            pipeline: Pipeline::new(wrap(collab), config),
            storage,
            recognition,
            store,
            mailer,
        }
    }

    /// Provision a tenant and upload photos. Each photo is
    /// `(file name, image bytes, people shown with their match confidence)`.
    pub async fn tenant_with_photos(
        &self,
        email: &str,
        photos: &[(&str, &[u8], &[(&str, f32)])],
    ) -> (Tenant, Vec<PhotoAsset>) {
        let tenant = self.pipeline.registry.provision(email).await.unwrap();
        let mut assets = Vec::with_capacity(photos.len());
        for (name, bytes, faces) in photos {
            if !faces.is_empty() {
                self.recognition.register_image(bytes, faces);
            }
            let asset = self
                .pipeline
                .indexer
                .upload(&tenant, name, bytes.to_vec())
                .await
                .unwrap();
            assets.push(asset);
        }
        (tenant, assets)
    }

    /// Like [`Harness::tenant_with_photos`], then index everything.
    pub async fn indexed_tenant(
        &self,
        email: &str,
        photos: &[(&str, &[u8], &[(&str, f32)])],
    ) -> (Tenant, Vec<PhotoAsset>) {
        let (tenant, assets) = self.tenant_with_photos(email, photos).await;
        self.pipeline.indexer.index(&tenant, &assets).await.unwrap();
        (tenant, assets)
    }
}

/// Recognition service whose first `index_faces` reply is lost after the
/// call was applied.
pub struct LostIndexReply {
    inner: Arc<dyn FaceRecognition>,
    lost: AtomicBool,
}

impl LostIndexReply {
    pub fn wrap(inner: Arc<dyn FaceRecognition>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            lost: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl FaceRecognition for LostIndexReply {
    async fn create_collection(&self) -> Result<String, ServiceError> {
        self.inner.create_collection().await
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<(), ServiceError> {
        self.inner.delete_collection(collection_id).await
    }

    async fn index_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        external_id: &str,
    ) -> Result<FaceIndexResponse, ServiceError> {
        let reply = self.inner.index_faces(collection_id, image, external_id).await?;
        if !self.lost.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::Timeout("index_faces reply lost".into()));
        }
        Ok(reply)
    }

    async fn list_faces(
        &self,
        collection_id: &str,
        external_id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        self.inner.list_faces(collection_id, external_id).await
    }

    async fn delete_faces(
        &self,
        collection_id: &str,
        face_ids: &[String],
    ) -> Result<usize, ServiceError> {
        self.inner.delete_faces(collection_id, face_ids).await
    }

    async fn search_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        threshold: f32,
        continuation_token: Option<&str>,
    ) -> Result<SearchResponse, ServiceError> {
        self.inner
            .search_faces(collection_id, image, threshold, continuation_token)
            .await
    }
}

/// Relational store with scripted write faults: a tenant insert that commits
/// but reports a timeout, and `record_faces` calls that fail outright.
pub struct FlakyStore {
    inner: Arc<dyn RelationalStore>,
    lose_insert_reply: AtomicBool,
    record_failures: AtomicU32,
}

impl FlakyStore {
    pub fn wrap(inner: Arc<dyn RelationalStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            lose_insert_reply: AtomicBool::new(false),
            record_failures: AtomicU32::new(0),
        })
    }

    /// The next `insert_tenant` commits, then answers with a timeout.
    pub fn lose_next_insert_reply(&self) {
        self.lose_insert_reply.store(true, Ordering::SeqCst);
    }

    /// The next `times` calls of `record_faces` fail without writing.
    pub fn fail_record_faces(&self, times: u32) {
        self.record_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelationalStore for FlakyStore {
    async fn insert_tenant(&self, tenant: NewTenant) -> Result<Tenant, ServiceError> {
        let inserted = self.inner.insert_tenant(tenant).await?;
        if self.lose_insert_reply.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::Timeout("insert_tenant reply lost".into()));
        }
        Ok(inserted)
    }

    async fn tenant_by_email(&self, email: &str) -> Result<Option<Tenant>, ServiceError> {
        self.inner.tenant_by_email(email).await
    }

    async fn tenant_by_passkey(&self, passkey: &str) -> Result<Option<Tenant>, ServiceError> {
        self.inner.tenant_by_passkey(passkey).await
    }

    async fn tenant_by_id(&self, id: TenantId) -> Result<Option<Tenant>, ServiceError> {
        self.inner.tenant_by_id(id).await
    }

    async fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<bool, ServiceError> {
        self.inner.set_tenant_active(id, active).await
    }

    async fn upsert_photo(
        &self,
        tenant_id: TenantId,
        storage_key: &str,
    ) -> Result<PhotoAsset, ServiceError> {
        self.inner.upsert_photo(tenant_id, storage_key).await
    }

    async fn photo(
        &self,
        tenant_id: TenantId,
        photo_id: PhotoId,
    ) -> Result<Option<PhotoAsset>, ServiceError> {
        self.inner.photo(tenant_id, photo_id).await
    }

    async fn photos(&self, tenant_id: TenantId) -> Result<Vec<PhotoAsset>, ServiceError> {
        self.inner.photos(tenant_id).await
    }

    async fn toggle_highlight(
        &self,
        tenant_id: TenantId,
        storage_key: &str,
    ) -> Result<PhotoAsset, ServiceError> {
        self.inner.toggle_highlight(tenant_id, storage_key).await
    }

    async fn face_record(&self, photo_id: PhotoId) -> Result<Option<FaceIndexRecord>, ServiceError> {
        self.inner.face_record(photo_id).await
    }

    async fn record_faces(
        &self,
        photo_id: PhotoId,
        face_ids: BTreeSet<String>,
    ) -> Result<FaceIndexRecord, ServiceError> {
        let pending = self
            .record_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(ServiceError::Rejected("record_faces refused".into()));
        }
        self.inner.record_faces(photo_id, face_ids).await
    }

    async fn mark_failed(&self, photo_id: PhotoId) -> Result<(), ServiceError> {
        self.inner.mark_failed(photo_id).await
    }

    async fn face_owners(&self, face_ids: Vec<String>) -> Result<Vec<FaceOwner>, ServiceError> {
        self.inner.face_owners(face_ids).await
    }
}

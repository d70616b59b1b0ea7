//! Relational store collaborator: tenants, photo assets, face records.

use async_trait::async_trait;
use smriti_core::{
    FaceIndexRecord, IndexStatus, PhotoAsset, PhotoId, ServiceError, Tenant, TenantId,
};
use std::collections::BTreeSet;

/// Fields of a tenant about to be inserted.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub email: String,
    pub passkey: String,
    pub client_passkey: String,
    pub storage_prefix: String,
    pub collection_id: String,
}

/// Which photo (and tenant) a collection face id was recorded for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceOwner {
    pub face_id: String,
    pub photo_asset_id: PhotoId,
    pub tenant_id: TenantId,
    pub status: IndexStatus,
}

/// Each method is one unit of work: it acquires the connection, runs in a
/// single transaction where it writes, and releases it before returning.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Fails with [`ServiceError::Conflict`] if the email is already taken.
    async fn insert_tenant(&self, tenant: NewTenant) -> Result<Tenant, ServiceError>;

    async fn tenant_by_email(&self, email: &str) -> Result<Option<Tenant>, ServiceError>;

    /// Look up by guest-facing passkey.
    async fn tenant_by_passkey(&self, passkey: &str) -> Result<Option<Tenant>, ServiceError>;

    async fn tenant_by_id(&self, id: TenantId) -> Result<Option<Tenant>, ServiceError>;

    /// Returns false when no such tenant exists.
    async fn set_tenant_active(&self, id: TenantId, active: bool) -> Result<bool, ServiceError>;

    /// Insert a pending photo, or reset an existing `failed` one to pending.
    /// Photos in any other state are returned unchanged.
    async fn upsert_photo(
        &self,
        tenant_id: TenantId,
        storage_key: &str,
    ) -> Result<PhotoAsset, ServiceError>;

    async fn photo(
        &self,
        tenant_id: TenantId,
        photo_id: PhotoId,
    ) -> Result<Option<PhotoAsset>, ServiceError>;

    async fn photos(&self, tenant_id: TenantId) -> Result<Vec<PhotoAsset>, ServiceError>;

    /// Flip the highlight flag, creating the photo (highlighted) if absent.
    async fn toggle_highlight(
        &self,
        tenant_id: TenantId,
        storage_key: &str,
    ) -> Result<PhotoAsset, ServiceError>;

    async fn face_record(&self, photo_id: PhotoId) -> Result<Option<FaceIndexRecord>, ServiceError>;

    /// Write the face record and mark the photo `indexed` (or `no_face` for
    /// an empty set). If a record already exists it is returned unchanged.
    async fn record_faces(
        &self,
        photo_id: PhotoId,
        face_ids: BTreeSet<String>,
    ) -> Result<FaceIndexRecord, ServiceError>;

    async fn mark_failed(&self, photo_id: PhotoId) -> Result<(), ServiceError>;

    /// Resolve face ids to their owning photos, across all tenants.
    async fn face_owners(&self, face_ids: Vec<String>) -> Result<Vec<FaceOwner>, ServiceError>;
}

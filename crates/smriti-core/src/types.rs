use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type TenantId = i64;
pub type PhotoId = i64;
pub type SessionId = uuid::Uuid;

/// One onboarded organizer/event with isolated storage and a dedicated
/// face collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub email: String,
    /// Guest-facing passkey.
    pub passkey: String,
    /// Owner-facing passkey.
    pub client_passkey: String,
    /// Object-store prefix; immutable once created.
    pub storage_prefix: String,
    /// Recognition collection id; immutable once created.
    pub collection_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Split a full storage key into the part below this tenant's prefix.
    ///
    /// Returns `None` when the key lives outside the prefix.
    pub fn relative_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key
            .strip_prefix(self.storage_prefix.as_str())?
            .strip_prefix('/')
            .filter(|rest| !rest.is_empty())
    }

    pub fn owns_key(&self, storage_key: &str) -> bool {
        self.relative_key(storage_key).is_some()
    }
}

/// Face-collection ingestion state of a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Pending,
    Indexed,
    /// Ingestion ran but the service found no face.
    NoFace,
    /// Retries exhausted; excluded from search until re-uploaded.
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexed => "indexed",
            IndexStatus::NoFace => "no_face",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IndexStatus::Pending),
            "indexed" => Some(IndexStatus::Indexed),
            "no_face" => Some(IndexStatus::NoFace),
            "failed" => Some(IndexStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoAsset {
    pub id: PhotoId,
    pub tenant_id: TenantId,
    /// Full object key, `<storage_prefix>/<name>`.
    pub storage_key: String,
    pub status: IndexStatus,
    pub is_highlight: bool,
}

impl PhotoAsset {
    /// True once face-collection ingestion has completed for this photo.
    pub fn indexed(&self) -> bool {
        matches!(self.status, IndexStatus::Indexed | IndexStatus::NoFace)
    }

    /// Base file name of the stored object.
    pub fn file_name(&self) -> &str {
        self.storage_key
            .rsplit('/')
            .next()
            .unwrap_or(self.storage_key.as_str())
    }
}

/// Face identifiers the recognition service assigned to one photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceIndexRecord {
    pub photo_asset_id: PhotoId,
    pub face_ids: BTreeSet<String>,
}

/// One unaggregated search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawHit {
    pub photo_asset_id: PhotoId,
    pub confidence: f32,
}

/// A distinct matched photo within one search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub search_session_id: SessionId,
    pub photo_asset_id: PhotoId,
    pub confidence: f32,
    /// 1-based position in the confidence-descending order.
    pub rank: usize,
}

impl MatchResult {
    pub fn as_raw_hit(&self) -> RawHit {
        RawHit {
            photo_asset_id: self.photo_asset_id,
            confidence: self.confidence,
        }
    }
}

/// Short-lived signed reference to one stored asset. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessHandle {
    pub photo_asset_id: PhotoId,
    pub storage_key: String,
    pub signed_url: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessHandle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-photo result of a collection indexing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed {
        photo_asset_id: PhotoId,
        face_ids: BTreeSet<String>,
    },
    /// A face index record already existed; nothing was sent to the service.
    AlreadyIndexed {
        photo_asset_id: PhotoId,
        face_ids: BTreeSet<String>,
    },
    NoFaceDetected {
        photo_asset_id: PhotoId,
    },
    FailedPermanently {
        photo_asset_id: PhotoId,
        attempts: u32,
        reason: String,
    },
}

impl IndexOutcome {
    pub fn photo_asset_id(&self) -> PhotoId {
        match self {
            IndexOutcome::Indexed { photo_asset_id, .. }
            | IndexOutcome::AlreadyIndexed { photo_asset_id, .. }
            | IndexOutcome::NoFaceDetected { photo_asset_id }
            | IndexOutcome::FailedPermanently { photo_asset_id, .. } => *photo_asset_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, IndexOutcome::FailedPermanently { .. })
    }
}

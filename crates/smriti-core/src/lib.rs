//! smriti-core — Data model and pure algorithms for the face-match pipeline.
//!
//! Holds the tenant/photo/match types shared by every other crate, the
//! match aggregation that turns raw recognition hits into a ranked photo
//! list, and the retry/throttle policy applied to every collaborator call.

pub mod aggregate;
pub mod error;
pub mod retry;
pub mod types;

pub use aggregate::aggregate;
pub use error::ServiceError;
pub use retry::{Attempted, RetryPolicy, Throttle};
pub use types::{
    AccessHandle, FaceIndexRecord, IndexOutcome, IndexStatus, MatchResult, PhotoAsset, PhotoId,
    RawHit, SessionId, Tenant, TenantId,
};

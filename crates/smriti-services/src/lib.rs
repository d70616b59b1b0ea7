//! smriti-services — External collaborators of the face-match pipeline.
//!
//! Each collaborator is an async trait so the pipeline can hold it as
//! `Arc<dyn ...>`. Concrete backends: SQLite relational store, filesystem
//! object storage, and in-memory storage/recognition used for local runs
//! and tests. Every call is scoped by the caller-supplied tenant prefix or
//! collection id; nothing here knows which tenant is "current".

pub mod email;
pub mod recognition;
pub mod signing;
pub mod sqlite;
pub mod storage;
pub mod store;

pub use email::{EmailDispatch, EmailTemplate, MemoryMailer, SentEmail, TracingMailer};
pub use recognition::{
    FaceHit, FaceIndexResponse, FaceRecognition, MemoryRecognition, RecognitionOp, SearchPage,
    SearchResponse,
};
pub use signing::{SignedUrl, UrlSigner};
pub use sqlite::SqliteStore;
pub use storage::{FsStorage, MemoryStorage, ObjectStorage};
pub use store::{FaceOwner, NewTenant, RelationalStore};

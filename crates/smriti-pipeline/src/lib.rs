//! smriti-pipeline — Face-match orchestration for event photo galleries.
//!
//! An organizer gets a tenant (storage prefix + face collection), uploads
//! photos that are indexed into the collection, and guests find themselves
//! by submitting a selfie. Matches come back as short-lived signed URLs,
//! optionally bundled into a zip archive.
//!
//! All collaborators are injected through [`Collaborators`]; this crate
//! holds no global state.

pub mod access;
pub mod archive;
pub mod config;
pub mod error;
pub mod indexer;
pub mod registry;
pub mod search;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use access::AccessBroker;
pub use archive::{ArchiveBuilder, ArchiveEntry, ArchiveFailure, ArchiveManifest};
pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use indexer::CollectionIndexer;
pub use registry::TenantRegistry;
pub use search::SearchOrchestrator;
pub use session::{GuestNotice, GuestSession, SessionState};

use smriti_core::Throttle;
use smriti_services::{EmailDispatch, FaceRecognition, ObjectStorage, RelationalStore};
use std::sync::Arc;

/// The external services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn ObjectStorage>,
    pub recognition: Arc<dyn FaceRecognition>,
    pub store: Arc<dyn RelationalStore>,
    pub mailer: Arc<dyn EmailDispatch>,
}

/// The assembled pipeline. Indexing and search share one recognition
/// throttle, so a busy indexer slows guest searches instead of tripping
/// the service's rate limit.
pub struct Pipeline {
    pub registry: TenantRegistry,
    pub indexer: CollectionIndexer,
    pub search: SearchOrchestrator,
    pub access: AccessBroker,
    pub archive: ArchiveBuilder,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(collab: Collaborators, config: PipelineConfig) -> Self {
        let config = config.normalized();
        let retry = config.retry_policy();
        let throttle = Arc::new(Throttle::per_second(config.requests_per_second));

        tracing::debug!(
            batch_size = config.batch_size,
            parallelism = config.parallelism,
            threshold = config.confidence_threshold,
            "pipeline assembled"
        );

        Self {
            registry: TenantRegistry::new(&collab, retry),
            indexer: CollectionIndexer::new(
                &collab,
                retry,
                throttle.clone(),
                config.batch_size,
                config.parallelism,
            ),
            search: SearchOrchestrator::new(
                &collab,
                retry,
                throttle,
                config.confidence_threshold,
                config.max_results,
            ),
            access: AccessBroker::new(&collab, retry),
            archive: ArchiveBuilder::new(&collab, retry),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

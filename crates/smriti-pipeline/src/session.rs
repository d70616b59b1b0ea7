//! Guest session: an explicit state machine for one guest interaction.
//!
//! ```text
//! Unauthenticated --authenticate--> Authenticated --search--> Searching
//!        ^                               ^                       |
//!        |                               +------reset------ ResultsReady
//!        +---------------- expiry / sign_out -------------------+
//! ```
//!
//! Nothing here is persisted. The probe image is owned by `search` and
//! dropped as soon as the recognition service has answered.
//!
//! Every command takes `&mut self`, so a session found in `Searching` at the
//! start of a command belongs to a search whose future was dropped. Such a
//! search is treated as abandoned and the command proceeds.

use crate::archive::ArchiveManifest;
use crate::error::PipelineError;
use crate::Pipeline;
use chrono::{DateTime, Utc};
use smriti_core::{AccessHandle, MatchResult, SessionId, Tenant};
use std::io::{Seek, Write};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated {
        tenant: Tenant,
    },
    Searching {
        tenant: Tenant,
    },
    ResultsReady {
        tenant: Tenant,
        matches: Vec<MatchResult>,
        handles: Vec<AccessHandle>,
    },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticated { .. } => "authenticated",
            SessionState::Searching { .. } => "searching",
            SessionState::ResultsReady { .. } => "results_ready",
        }
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        match self {
            SessionState::Unauthenticated => None,
            SessionState::Authenticated { tenant }
            | SessionState::Searching { tenant }
            | SessionState::ResultsReady { tenant, .. } => Some(tenant),
        }
    }
}

/// What the guest is told after a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestNotice {
    Matches(usize),
    NoMatches,
    NoFaceInProbe,
}

impl GuestNotice {
    pub fn message(&self) -> String {
        match self {
            GuestNotice::Matches(1) => "We found 1 photo of you.".to_string(),
            GuestNotice::Matches(n) => format!("We found {n} photos of you."),
            GuestNotice::NoMatches => "No photos of you were found in this event.".to_string(),
            GuestNotice::NoFaceInProbe => PipelineError::NoFaceInProbe.user_message().to_string(),
        }
    }
}

pub struct GuestSession {
    id: SessionId,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ttl: chrono::Duration,
    state: SessionState,
}

impl GuestSession {
    pub fn new(ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            id: uuid::Uuid::new_v4(),
            created_at: now,
            expires_at: now + ttl,
            ttl,
            state: SessionState::Unauthenticated,
        }
    }

    /// A session using the pipeline's configured lifetime.
    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.config().session_ttl())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn matches(&self) -> &[MatchResult] {
        match &self.state {
            SessionState::ResultsReady { matches, .. } => matches,
            _ => &[],
        }
    }

    pub fn handles(&self) -> &[AccessHandle] {
        match &self.state {
            SessionState::ResultsReady { handles, .. } => handles,
            _ => &[],
        }
    }

    /// Resolve a guest passkey. Allowed from any state; previous results
    /// are discarded and the session lifetime restarts.
    pub async fn authenticate(
        &mut self,
        pipeline: &Pipeline,
        passkey: &str,
    ) -> Result<&Tenant, PipelineError> {
        self.state = SessionState::Unauthenticated;

        let tenant = pipeline.registry.resolve(passkey).await?;
        self.expires_at = Utc::now() + self.ttl;
        tracing::info!(session = %self.id, tenant = tenant.id, "guest authenticated");
        self.state = SessionState::Authenticated { tenant };
        match &self.state {
            SessionState::Authenticated { tenant } => Ok(tenant),
            _ => Err(PipelineError::SessionState(self.state.name())),
        }
    }

    /// Match the guest's selfie and prepare access handles.
    ///
    /// Allowed from `Authenticated`, `ResultsReady` (a new search replaces
    /// the old results) and an abandoned `Searching`. A probe without a face
    /// is a notice, not an error; every other failure returns the session to
    /// `Authenticated`.
    pub async fn search(
        &mut self,
        pipeline: &Pipeline,
        probe: Vec<u8>,
    ) -> Result<GuestNotice, PipelineError> {
        self.check_expiry(Utc::now())?;
        let tenant = match std::mem::replace(&mut self.state, SessionState::Unauthenticated) {
            SessionState::Authenticated { tenant }
            | SessionState::Searching { tenant }
            | SessionState::ResultsReady { tenant, .. } => tenant,
            other => {
                let name = other.name();
                self.state = other;
                return Err(PipelineError::SessionState(name));
            }
        };
        self.state = SessionState::Searching {
            tenant: tenant.clone(),
        };

        let found = pipeline.search.search(&tenant, &probe).await;
        drop(probe);

        let hits = match found {
            Ok(hits) => hits,
            Err(PipelineError::NoFaceInProbe) => {
                self.state = SessionState::Authenticated { tenant };
                return Ok(GuestNotice::NoFaceInProbe);
            }
            Err(e) => {
                self.state = SessionState::Authenticated { tenant };
                return Err(e);
            }
        };

        let matches = pipeline.access.aggregate(self.id, &hits);
        let handles = match pipeline
            .access
            .grant_access(&tenant, &matches, pipeline.config().url_ttl())
            .await
        {
            Ok(handles) => handles,
            Err(e) => {
                self.state = SessionState::Authenticated { tenant };
                return Err(e);
            }
        };

        let notice = if handles.is_empty() {
            GuestNotice::NoMatches
        } else {
            GuestNotice::Matches(handles.len())
        };
        tracing::info!(session = %self.id, tenant = tenant.id, matches = matches.len(), "search results ready");
        self.state = SessionState::ResultsReady {
            tenant,
            matches,
            handles,
        };
        Ok(notice)
    }

    /// Discard results (or an abandoned search) and go back to
    /// `Authenticated`.
    pub fn reset(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Unauthenticated);
        self.state = match state {
            SessionState::Unauthenticated => SessionState::Unauthenticated,
            SessionState::Authenticated { tenant }
            | SessionState::Searching { tenant }
            | SessionState::ResultsReady { tenant, .. } => SessionState::Authenticated { tenant },
        };
    }

    pub fn sign_out(&mut self) {
        self.state = SessionState::Unauthenticated;
    }

    /// Bundle the current results into a zip written to `sink`.
    pub async fn archive<W: Write + Seek>(
        &mut self,
        pipeline: &Pipeline,
        sink: W,
    ) -> Result<(W, ArchiveManifest), PipelineError> {
        self.check_expiry(Utc::now())?;
        match &self.state {
            SessionState::ResultsReady { handles, .. } => {
                pipeline.archive.build_archive(handles, sink).await
            }
            other => Err(PipelineError::SessionState(other.name())),
        }
    }

    fn check_expiry(&mut self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        if now >= self.expires_at && self.state != SessionState::Unauthenticated {
            tracing::info!(session = %self.id, "guest session expired");
            self.state = SessionState::Unauthenticated;
            return Err(PipelineError::SessionExpired);
        }
        Ok(())
    }
}

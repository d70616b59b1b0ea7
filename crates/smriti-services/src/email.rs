//! Email dispatch collaborator. Best-effort: callers log failures and move on.

use async_trait::async_trait;
use smriti_core::ServiceError;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    /// Onboarding mail carrying the organizer and guest passkeys.
    Welcome,
}

impl EmailTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::Welcome => "welcome",
        }
    }
}

#[async_trait]
pub trait EmailDispatch: Send + Sync {
    async fn send(
        &self,
        template: EmailTemplate,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError>;
}

/// Mailer that only records the dispatch in the trace log.
/// Variable values are not logged; they carry passkeys.
#[derive(Debug, Default)]
pub struct TracingMailer;

#[async_trait]
impl EmailDispatch for TracingMailer {
    async fn send(
        &self,
        template: EmailTemplate,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        tracing::info!(
            template = template.name(),
            recipient,
            variables = ?variables.keys().collect::<Vec<_>>(),
            "email dispatched"
        );
        Ok(())
    }
}

/// A message captured by [`MemoryMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub template: EmailTemplate,
    pub recipient: String,
    pub variables: BTreeMap<String, String>,
}

/// Mailer that keeps every message in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentEmail>>,
    failing: Mutex<bool>,
}

impl MemoryMailer {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = failing;
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl EmailDispatch for MemoryMailer {
    async fn send(
        &self,
        template: EmailTemplate,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        if *self.failing.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ServiceError::Transient("mail relay unavailable".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SentEmail {
                template,
                recipient: recipient.to_string(),
                variables: variables.clone(),
            });
        Ok(())
    }
}

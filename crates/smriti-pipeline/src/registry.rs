//! Tenant Registry: passkey resolution and all-or-nothing provisioning.

use crate::error::PipelineError;
use crate::Collaborators;
use smriti_core::{RetryPolicy, ServiceError, Tenant, TenantId};
use smriti_services::{EmailDispatch, EmailTemplate, FaceRecognition, NewTenant, ObjectStorage, RelationalStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub struct TenantRegistry {
    store: Arc<dyn RelationalStore>,
    storage: Arc<dyn ObjectStorage>,
    recognition: Arc<dyn FaceRecognition>,
    mailer: Arc<dyn EmailDispatch>,
    retry: RetryPolicy,
    /// Per-email provisioning locks.
    provisioning: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Keys generated for a tenant that is about to be provisioned.
struct TenantKeys {
    passkey: String,
    client_passkey: String,
    storage_prefix: String,
}

impl TenantKeys {
    fn generate() -> Self {
        Self {
            passkey: format!("smriti_user_{}", short_hex(8)),
            client_passkey: format!("smriti_client_{}", short_hex(8)),
            storage_prefix: format!("Wedding_images/{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

fn short_hex(len: usize) -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(len);
    s
}

fn normalize_email(email: &str) -> Result<String, PipelineError> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(PipelineError::InvalidInput(format!("not an email address: {email:?}"))),
    }
}

impl TenantRegistry {
    pub fn new(collab: &Collaborators, retry: RetryPolicy) -> Self {
        Self {
            store: collab.store.clone(),
            storage: collab.storage.clone(),
            recognition: collab.recognition.clone(),
            mailer: collab.mailer.clone(),
            retry,
            provisioning: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a guest passkey to its active tenant.
    pub async fn resolve(&self, passkey: &str) -> Result<Tenant, PipelineError> {
        let passkey = passkey.trim();
        if passkey.is_empty() {
            return Err(PipelineError::InvalidPasskey);
        }
        let found = self
            .retry
            .run("tenant_by_passkey", || self.store.tenant_by_passkey(passkey))
            .await
            .map_err(|a| PipelineError::from_attempt("tenant_by_passkey", a))?;
        match found {
            Some(t) if t.active => Ok(t),
            Some(t) => {
                tracing::info!(tenant = t.id, "passkey belongs to deactivated tenant");
                Err(PipelineError::InvalidPasskey)
            }
            None => Err(PipelineError::InvalidPasskey),
        }
    }

    /// Organizer login: the owner-facing passkey must match the email's tenant.
    pub async fn login_organizer(
        &self,
        email: &str,
        client_passkey: &str,
    ) -> Result<Tenant, PipelineError> {
        let email = normalize_email(email)?;
        let tenant = self
            .retry
            .run("tenant_by_email", || self.store.tenant_by_email(&email))
            .await
            .map_err(|a| PipelineError::from_attempt("tenant_by_email", a))?
            .filter(|t| t.active)
            .ok_or(PipelineError::InvalidPasskey)?;
        if tenant.client_passkey.trim() != client_passkey.trim() {
            tracing::info!(tenant = tenant.id, "organizer passkey mismatch");
            return Err(PipelineError::InvalidPasskey);
        }
        Ok(tenant)
    }

    pub async fn tenant(&self, id: TenantId) -> Result<Tenant, PipelineError> {
        self.retry
            .run("tenant_by_id", || self.store.tenant_by_id(id))
            .await
            .map_err(|a| PipelineError::from_attempt("tenant_by_id", a))?
            .ok_or_else(|| PipelineError::Service(ServiceError::NotFound(format!("tenant {id}"))))
    }

    /// Provision a tenant for `email`, or return the existing one.
    ///
    /// Creates the storage prefix and the recognition collection before the
    /// tenant row is written, so `resolve` never sees a half-provisioned
    /// tenant. On any failure the created resources are rolled back.
    pub async fn provision(&self, email: &str) -> Result<Tenant, PipelineError> {
        let email = normalize_email(email)?;

        let lock = {
            let mut locks = self.provisioning.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(email.clone()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.provision_locked(&email).await
        };

        let mut locks = self.provisioning.lock().unwrap_or_else(|p| p.into_inner());
        // Map entry plus our clone: nobody else is waiting on this email.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&email);
        }
        result
    }

    async fn provision_locked(&self, email: &str) -> Result<Tenant, PipelineError> {
        if let Some(existing) = self.find_by_email(email).await? {
            tracing::debug!(tenant = existing.id, "tenant already provisioned");
            return Ok(existing);
        }
        self.create(email).await
    }

    /// Create the prefix, the collection and the tenant row, in that order.
    async fn create(&self, email: &str) -> Result<Tenant, PipelineError> {
        let keys = TenantKeys::generate();
        self.retry
            .run("ensure_prefix", || self.storage.ensure_prefix(&keys.storage_prefix))
            .await
            .map_err(|a| PipelineError::from_attempt("ensure_prefix", a))?;

        let collection_id = match self
            .retry
            .run("create_collection", || self.recognition.create_collection())
            .await
        {
            Ok(id) => id,
            Err(a) => {
                self.rollback(&keys.storage_prefix, None).await;
                return Err(PipelineError::from_attempt("create_collection", a));
            }
        };

        let new = NewTenant {
            email: email.to_string(),
            passkey: keys.passkey,
            client_passkey: keys.client_passkey,
            storage_prefix: keys.storage_prefix.clone(),
            collection_id: collection_id.clone(),
        };
        let inserted = self
            .retry
            .run("insert_tenant", || self.store.insert_tenant(new.clone()))
            .await;

        match inserted {
            Ok(tenant) => {
                tracing::info!(
                    tenant = tenant.id,
                    collection = %tenant.collection_id,
                    "tenant provisioned"
                );
                self.send_welcome(&tenant).await;
                Ok(tenant)
            }
            Err(a) if matches!(a.error, ServiceError::Conflict(_)) => {
                let winner = self.find_by_email(email).await?.ok_or_else(|| {
                    PipelineError::Service(ServiceError::Conflict(format!(
                        "tenant for {email} conflicted but could not be read back"
                    )))
                })?;
                if winner.collection_id == collection_id
                    && winner.storage_prefix == keys.storage_prefix
                {
                    // An earlier attempt committed and only its reply was lost.
                    tracing::info!(
                        tenant = winner.id,
                        collection = %winner.collection_id,
                        attempts = a.attempts,
                        "tenant provisioned"
                    );
                    self.send_welcome(&winner).await;
                    return Ok(winner);
                }
                tracing::info!(tenant = winner.id, "lost provisioning race; keeping existing tenant");
                self.rollback(&keys.storage_prefix, Some(&collection_id)).await;
                Ok(winner)
            }
            Err(a) => {
                self.rollback(&keys.storage_prefix, Some(&collection_id)).await;
                Err(PipelineError::from_attempt("insert_tenant", a))
            }
        }
    }

    /// Soft-delete: the tenant stops resolving; storage and collection stay.
    pub async fn deactivate(&self, id: TenantId) -> Result<(), PipelineError> {
        let found = self
            .retry
            .run("set_tenant_active", || self.store.set_tenant_active(id, false))
            .await
            .map_err(|a| PipelineError::from_attempt("set_tenant_active", a))?;
        if !found {
            return Err(PipelineError::Service(ServiceError::NotFound(format!("tenant {id}"))));
        }
        tracing::info!(tenant = id, "tenant deactivated");
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Tenant>, PipelineError> {
        self.retry
            .run("tenant_by_email", || self.store.tenant_by_email(email))
            .await
            .map_err(|a| PipelineError::from_attempt("tenant_by_email", a))
    }

    async fn rollback(&self, prefix: &str, collection_id: Option<&str>) {
        if let Some(id) = collection_id {
            if let Err(err) = self.recognition.delete_collection(id).await {
                tracing::warn!(collection = id, error = %err, "rollback: delete collection failed");
            }
        }
        if let Err(err) = self.storage.remove_prefix(prefix).await {
            tracing::warn!(prefix, error = %err, "rollback: remove prefix failed");
        }
    }

    /// Best-effort onboarding mail; failures are logged, never retried.
    async fn send_welcome(&self, tenant: &Tenant) {
        let variables = BTreeMap::from([
            ("client_passkey".to_string(), tenant.client_passkey.clone()),
            ("user_passkey".to_string(), tenant.passkey.clone()),
        ]);
        if let Err(err) = self
            .mailer
            .send(EmailTemplate::Welcome, &tenant.email, &variables)
            .await
        {
            tracing::warn!(tenant = tenant.id, error = %err, "welcome email not sent");
        }
    }
}

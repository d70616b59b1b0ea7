//! HMAC-SHA256 signed, time-limited object URLs.
//!
//! URL shape: `<base>/<object path>?expires=<unix secs>&signature=<hex>`,
//! where the signature covers `"<object path>\n<expires>"`.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use smriti_core::ServiceError;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// A freshly issued signed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

pub struct UrlSigner {
    base_url: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(base_url: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.as_ref().to_vec(),
        }
    }

    pub fn sign(&self, path: &str, ttl: Duration, now: DateTime<Utc>) -> Result<SignedUrl, ServiceError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ServiceError::Rejected(format!("ttl out of range: {e}")))?;
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();
        let signature = hex::encode(self.mac(path, expires)?.finalize().into_bytes());
        Ok(SignedUrl {
            url: format!("{}/{path}?expires={expires}&signature={signature}", self.base_url),
            // Truncate to whole seconds so the handle agrees with the URL.
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        })
    }

    /// Verify a URL previously produced by [`sign`](Self::sign) and return
    /// the object path it grants.
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> Result<String, ServiceError> {
        let rest = url
            .strip_prefix(self.base_url.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| ServiceError::Rejected("url not issued by this store".into()))?;
        let (path, query) = rest
            .rsplit_once('?')
            .ok_or_else(|| ServiceError::Rejected("unsigned url".into()))?;

        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse::<i64>().ok(),
                Some(("signature", v)) => signature = hex::decode(v).ok(),
                _ => {}
            }
        }
        let (Some(expires), Some(signature)) = (expires, signature) else {
            return Err(ServiceError::Rejected("malformed signed url".into()));
        };

        self.mac(path, expires)?
            .verify_slice(&signature)
            .map_err(|_| ServiceError::Rejected("bad url signature".into()))?;

        if now.timestamp() >= expires {
            return Err(ServiceError::Rejected("signed url expired".into()));
        }
        Ok(path.to_string())
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ServiceError::Rejected(format!("signing key: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}

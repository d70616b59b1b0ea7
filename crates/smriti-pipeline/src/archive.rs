//! Archive Builder: bundles granted photos into a zip, one asset at a time.

use crate::error::PipelineError;
use crate::Collaborators;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smriti_core::{AccessHandle, PhotoId, RetryPolicy};
use smriti_services::ObjectStorage;
use std::collections::HashSet;
use std::io::{Seek, Write};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Name of the manifest entry written last into every archive.
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub photo_asset_id: PhotoId,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFailure {
    pub photo_asset_id: PhotoId,
    pub storage_key: String,
    pub reason: String,
}

/// What went into an archive and what could not be retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ArchiveEntry>,
    pub failures: Vec<ArchiveFailure>,
}

pub struct ArchiveBuilder {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
}

impl ArchiveBuilder {
    pub fn new(collab: &Collaborators, retry: RetryPolicy) -> Self {
        Self {
            storage: collab.storage.clone(),
            retry,
        }
    }

    /// Write every handle's asset into a zip on `sink`, in the given order.
    ///
    /// Assets are fetched through their signed URLs one at a time and
    /// written straight through; at most one asset is held in memory. An
    /// asset that cannot be fetched (expired handle, missing object,
    /// exhausted retries) is left out and listed under `failures` in the
    /// manifest. Errors writing to `sink` abort the archive.
    pub async fn build_archive<W: Write + Seek>(
        &self,
        handles: &[AccessHandle],
        sink: W,
    ) -> Result<(W, ArchiveManifest), PipelineError> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = ZipWriter::new(sink);
        let mut names = EntryNames::default();
        let mut manifest = ArchiveManifest {
            created_at: Utc::now(),
            entries: Vec::with_capacity(handles.len()),
            failures: Vec::new(),
        };

        for handle in handles {
            let bytes = match self.fetch(handle).await {
                Ok(bytes) => bytes,
                Err(reason) => {
                    tracing::warn!(photo = handle.photo_asset_id, %reason, "asset left out of archive");
                    manifest.failures.push(ArchiveFailure {
                        photo_asset_id: handle.photo_asset_id,
                        storage_key: handle.storage_key.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let name = names.claim(base_name(&handle.storage_key));
            zip.start_file(name.as_str(), options)?;
            zip.write_all(&bytes)?;
            manifest.entries.push(ArchiveEntry {
                name,
                photo_asset_id: handle.photo_asset_id,
                bytes: bytes.len() as u64,
            });
        }

        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        zip.start_file(MANIFEST_NAME, options)?;
        zip.write_all(&json)?;
        let sink = zip.finish()?;

        tracing::info!(
            included = manifest.entries.len(),
            failed = manifest.failures.len(),
            "archive built"
        );
        Ok((sink, manifest))
    }

    async fn fetch(&self, handle: &AccessHandle) -> Result<Vec<u8>, String> {
        if handle.is_expired(Utc::now()) {
            return Err("access handle expired".to_string());
        }
        self.retry
            .run("fetch_signed", || self.storage.fetch_signed(&handle.signed_url))
            .await
            .map_err(|a| format!("{} (after {} attempts)", a.error, a.attempts))
    }
}

fn base_name(storage_key: &str) -> &str {
    match storage_key.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => "photo",
    }
}

/// Hands out unique entry names; `manifest.json` is always taken.
#[derive(Default)]
struct EntryNames {
    used: HashSet<String>,
}

impl EntryNames {
    fn claim(&mut self, name: &str) -> String {
        if self.used.is_empty() {
            self.used.insert(MANIFEST_NAME.to_string());
        }
        if self.used.insert(name.to_string()) {
            return name.to_string();
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
            _ => (name, String::new()),
        };
        let mut n = 1;
        loop {
            let candidate = format!("{stem}-{n}{ext}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

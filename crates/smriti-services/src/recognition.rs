//! Face recognition collaborator.
//!
//! The recognition service owns face detection, embedding and matching.
//! The pipeline only sees collections, opaque face ids, and confidence
//! scores on whatever scale the service reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smriti_core::ServiceError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Outcome of indexing one image into a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaceIndexResponse {
    Faces(Vec<String>),
    NoFace,
}

/// A collection face that matched the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceHit {
    pub face_id: String,
    /// External id attached at indexing time (the photo asset id).
    pub external_image_id: Option<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPage {
    pub hits: Vec<FaceHit>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchResponse {
    /// The probe image contained no detectable face.
    NoFaceInProbe,
    Page(SearchPage),
}

#[async_trait]
pub trait FaceRecognition: Send + Sync {
    async fn create_collection(&self) -> Result<String, ServiceError>;

    async fn delete_collection(&self, collection_id: &str) -> Result<(), ServiceError>;

    async fn index_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        external_id: &str,
    ) -> Result<FaceIndexResponse, ServiceError>;

    /// Ids of the collection faces tagged with `external_id`.
    async fn list_faces(
        &self,
        collection_id: &str,
        external_id: &str,
    ) -> Result<Vec<String>, ServiceError>;

    /// Remove faces by id. Unknown ids are ignored; returns how many went.
    async fn delete_faces(
        &self,
        collection_id: &str,
        face_ids: &[String],
    ) -> Result<usize, ServiceError>;

    async fn search_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        threshold: f32,
        continuation_token: Option<&str>,
    ) -> Result<SearchResponse, ServiceError>;
}

/// Which recognition call a queued fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecognitionOp {
    CreateCollection,
    IndexFaces,
    ListFaces,
    DeleteFaces,
    SearchFaces,
}

#[derive(Debug, Clone)]
struct StoredFace {
    face_id: String,
    person: String,
    external_id: String,
    confidence: f32,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<StoredFace>>,
    /// Registered image bytes -> faces the "detector" finds in them.
    images: HashMap<Vec<u8>, Vec<(String, f32)>>,
    faults: HashMap<RecognitionOp, VecDeque<ServiceError>>,
    image_faults: HashMap<Vec<u8>, (u32, ServiceError)>,
    calls: HashMap<RecognitionOp, usize>,
}

/// Deterministic in-process recognition service.
///
/// Images must be registered with the people they show; indexing an
/// unregistered image reports no face. A search matches every collection
/// face of the probe's first person, scored with the confidence given for
/// that face when its photo was registered.
pub struct MemoryRecognition {
    inner: Mutex<Inner>,
    page_size: usize,
}

impl Default for MemoryRecognition {
    fn default() -> Self {
        Self::new(100)
    }
}

impl MemoryRecognition {
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: page_size.max(1),
        }
    }

    /// Declare which people appear in `image`, each with the confidence a
    /// search for that person reports against this face.
    pub fn register_image(&self, image: &[u8], faces: &[(&str, f32)]) {
        self.lock().images.insert(
            image.to_vec(),
            faces.iter().map(|(p, c)| (p.to_string(), *c)).collect(),
        );
    }

    /// Queue errors returned by the next calls of `op`, in order.
    pub fn fail_next(&self, op: RecognitionOp, errors: impl IntoIterator<Item = ServiceError>) {
        self.lock().faults.entry(op).or_default().extend(errors);
    }

    /// Make the next `times` index calls for `image` fail with `error`.
    pub fn fail_image(&self, image: &[u8], times: u32, error: ServiceError) {
        self.lock().image_faults.insert(image.to_vec(), (times, error));
    }

    pub fn face_count(&self, collection_id: &str) -> usize {
        self.lock()
            .collections
            .get(collection_id)
            .map_or(0, Vec::len)
    }

    /// Faces in the collection tagged with `external_id`.
    pub fn faces_for(&self, collection_id: &str, external_id: &str) -> usize {
        self.lock()
            .collections
            .get(collection_id)
            .map_or(0, |faces| faces.iter().filter(|f| f.external_id == external_id).count())
    }

    pub fn collection_count(&self) -> usize {
        self.lock().collections.len()
    }

    pub fn collection_exists(&self, collection_id: &str) -> bool {
        self.lock().collections.contains_key(collection_id)
    }

    pub fn calls(&self, op: RecognitionOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Inner {
    fn enter(&mut self, op: RecognitionOp) -> Result<(), ServiceError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FaceRecognition for MemoryRecognition {
    async fn create_collection(&self) -> Result<String, ServiceError> {
        let mut inner = self.lock();
        inner.enter(RecognitionOp::CreateCollection)?;
        let id = format!("smriti-collection-{}", uuid::Uuid::new_v4().simple());
        inner.collections.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<(), ServiceError> {
        self.lock()
            .collections
            .remove(collection_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(collection_id.to_string()))
    }

    async fn index_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        external_id: &str,
    ) -> Result<FaceIndexResponse, ServiceError> {
        let mut inner = self.lock();
        inner.enter(RecognitionOp::IndexFaces)?;

        if let Some((remaining, err)) = inner.image_faults.get_mut(image) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }

        let faces = inner.images.get(image).cloned().unwrap_or_default();
        let collection = inner
            .collections
            .get_mut(collection_id)
            .ok_or_else(|| ServiceError::NotFound(collection_id.to_string()))?;

        if faces.is_empty() {
            return Ok(FaceIndexResponse::NoFace);
        }

        let mut ids = Vec::with_capacity(faces.len());
        for (person, confidence) in faces {
            let face_id = uuid::Uuid::new_v4().to_string();
            collection.push(StoredFace {
                face_id: face_id.clone(),
                person,
                external_id: external_id.to_string(),
                confidence,
            });
            ids.push(face_id);
        }
        Ok(FaceIndexResponse::Faces(ids))
    }

    async fn list_faces(
        &self,
        collection_id: &str,
        external_id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let mut inner = self.lock();
        inner.enter(RecognitionOp::ListFaces)?;
        let collection = inner
            .collections
            .get(collection_id)
            .ok_or_else(|| ServiceError::NotFound(collection_id.to_string()))?;
        Ok(collection
            .iter()
            .filter(|f| f.external_id == external_id)
            .map(|f| f.face_id.clone())
            .collect())
    }

    async fn delete_faces(
        &self,
        collection_id: &str,
        face_ids: &[String],
    ) -> Result<usize, ServiceError> {
        let mut inner = self.lock();
        inner.enter(RecognitionOp::DeleteFaces)?;
        let collection = inner
            .collections
            .get_mut(collection_id)
            .ok_or_else(|| ServiceError::NotFound(collection_id.to_string()))?;
        let before = collection.len();
        collection.retain(|f| !face_ids.contains(&f.face_id));
        Ok(before - collection.len())
    }

    async fn search_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        threshold: f32,
        continuation_token: Option<&str>,
    ) -> Result<SearchResponse, ServiceError> {
        let mut inner = self.lock();
        inner.enter(RecognitionOp::SearchFaces)?;

        let collection = inner
            .collections
            .get(collection_id)
            .ok_or_else(|| ServiceError::NotFound(collection_id.to_string()))?;

        let Some((person, _)) = inner.images.get(image).and_then(|f| f.first()) else {
            return Ok(SearchResponse::NoFaceInProbe);
        };

        let offset = match continuation_token {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| ServiceError::Rejected(format!("bad continuation token {t:?}")))?,
        };

        let mut matching: Vec<&StoredFace> = collection
            .iter()
            .filter(|f| &f.person == person && f.confidence >= threshold)
            .collect();
        matching.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.face_id.cmp(&b.face_id))
        });

        let end = (offset + self.page_size).min(matching.len());
        let hits = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|f| FaceHit {
                face_id: f.face_id.clone(),
                external_image_id: Some(f.external_id.clone()),
                confidence: f.confidence,
            })
            .collect();
        let next_token = (end < matching.len()).then(|| end.to_string());

        Ok(SearchResponse::Page(SearchPage { hits, next_token }))
    }
}

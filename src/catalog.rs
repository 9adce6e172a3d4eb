//! Read-mostly view of the media catalog. The catalog itself (file-system
//! scanning, EXIF/probe extraction) lives outside this crate; the engine only
//! lists records and writes hashes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Unknown media id: {0}")]
    UnknownMedia(String),

    #[error("Catalog backend error: {0}")]
    Backend(String),
}

/// A project-scoped media item as the catalog exposes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub project_id: String,
    pub path: Option<PathBuf>,
    pub capture_timestamp: Option<DateTime<Utc>>,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<String>,
    pub hash_attempts: u32,
    pub source_device: Option<String>,
}

impl MediaRecord {
    pub fn resolution(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    /// Only records without a content hash (backfill scans).
    pub missing_content_hash: bool,
    /// Resume point: only records with id strictly greater than this.
    pub after_media_id: Option<String>,
    pub limit: Option<usize>,
}

impl MediaFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn missing_hash() -> Self {
        Self {
            missing_content_hash: true,
            ..Self::default()
        }
    }
}

/// Injected catalog dependency. Listings are ordered by media id so chunked
/// scans can resume from a checkpoint.
pub trait MediaCatalog: Send + Sync {
    fn list_media(
        &self,
        project_id: &str,
        filter: &MediaFilter,
    ) -> Result<Vec<MediaRecord>, CatalogError>;

    fn get_media(&self, media_id: &str) -> Result<Option<MediaRecord>, CatalogError>;

    fn store_content_hash(&self, media_id: &str, content_hash: &str) -> Result<(), CatalogError>;

    fn store_perceptual_hash(
        &self,
        media_id: &str,
        perceptual_hash: &str,
    ) -> Result<(), CatalogError>;

    /// Bumps the bounded retry counter for an unreadable file.
    fn record_hash_failure(&self, media_id: &str) -> Result<(), CatalogError>;
}

/// Catalog backed by a process-local map. Serves tests and embedded setups
/// where the caller owns record ingestion.
pub struct InMemoryCatalog {
    records: RwLock<BTreeMap<String, MediaRecord>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, record: MediaRecord) {
        self.records
            .write()
            .expect("catalog lock poisoned")
            .insert(record.id.clone(), record);
    }

    fn update<F>(&self, media_id: &str, apply: F) -> Result<(), CatalogError>
    where
        F: FnOnce(&mut MediaRecord),
    {
        let mut records = self.records.write().expect("catalog lock poisoned");
        let record = records
            .get_mut(media_id)
            .ok_or_else(|| CatalogError::UnknownMedia(media_id.to_string()))?;
        apply(record);
        Ok(())
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaCatalog for InMemoryCatalog {
    fn list_media(
        &self,
        project_id: &str,
        filter: &MediaFilter,
    ) -> Result<Vec<MediaRecord>, CatalogError> {
        let records = self.records.read().expect("catalog lock poisoned");
        let mut matched: Vec<MediaRecord> = records
            .values()
            .filter(|r| r.project_id == project_id)
            .filter(|r| !filter.missing_content_hash || r.content_hash.is_none())
            .filter(|r| match &filter.after_media_id {
                Some(after) => r.id.as_str() > after.as_str(),
                None => true,
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn get_media(&self, media_id: &str) -> Result<Option<MediaRecord>, CatalogError> {
        let records = self.records.read().expect("catalog lock poisoned");
        Ok(records.get(media_id).cloned())
    }

    fn store_content_hash(&self, media_id: &str, content_hash: &str) -> Result<(), CatalogError> {
        self.update(media_id, |r| r.content_hash = Some(content_hash.to_string()))
    }

    fn store_perceptual_hash(
        &self,
        media_id: &str,
        perceptual_hash: &str,
    ) -> Result<(), CatalogError> {
        self.update(media_id, |r| {
            r.perceptual_hash = Some(perceptual_hash.to_string())
        })
    }

    fn record_hash_failure(&self, media_id: &str) -> Result<(), CatalogError> {
        self.update(media_id, |r| r.hash_attempts += 1)
    }
}

//! Chunked hash backfill over catalog records that have no content hash yet.
//! Restartable: progress is checkpointed by media id, per-file failures are
//! counted and retried on later runs up to a bounded attempt limit.

use crate::catalog::{CatalogError, MediaCatalog, MediaFilter, MediaRecord};
use crate::core::resolver::{AssetResolver, ResolveError};
use crate::services::hash::ContentHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Records fetched and processed per chunk.
    pub chunk_size: usize,
    /// Files that failed hashing this many times are left alone until the
    /// counter is reset externally.
    pub max_hash_attempts: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            max_hash_attempts: 3,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BackfillReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Checkpoint for the next run; `None` when the scan finished or nothing
    /// was listed.
    pub last_media_id: Option<String>,
    pub cancelled: bool,
}

pub struct HashBackfillWorker {
    catalog: Arc<dyn MediaCatalog>,
    hasher: Arc<dyn ContentHasher>,
    resolver: AssetResolver,
    config: BackfillConfig,
}

impl HashBackfillWorker {
    pub fn new(
        catalog: Arc<dyn MediaCatalog>,
        hasher: Arc<dyn ContentHasher>,
        resolver: AssetResolver,
        config: BackfillConfig,
    ) -> Self {
        Self {
            catalog,
            hasher,
            resolver,
            config,
        }
    }

    /// Hashes every unhashed record in the project and resolves it to an
    /// asset. `checkpoint` resumes a previous run.
    pub fn run(
        &self,
        project_id: &str,
        cancel: &AtomicBool,
        checkpoint: Option<String>,
    ) -> Result<BackfillReport, BackfillError> {
        let mut report = BackfillReport {
            last_media_id: checkpoint,
            ..BackfillReport::default()
        };

        loop {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                return Ok(report);
            }

            let filter = MediaFilter {
                missing_content_hash: true,
                after_media_id: report.last_media_id.clone(),
                limit: Some(self.config.chunk_size),
            };
            let chunk = self.catalog.list_media(project_id, &filter)?;
            if chunk.is_empty() {
                report.last_media_id = None;
                return Ok(report);
            }

            for record in &chunk {
                if cancel.load(Ordering::Relaxed) {
                    report.cancelled = true;
                    return Ok(report);
                }
                report.last_media_id = Some(record.id.clone());
                self.process_record(record, &mut report)?;
            }
        }
    }

    fn process_record(
        &self,
        record: &MediaRecord,
        report: &mut BackfillReport,
    ) -> Result<(), BackfillError> {
        if record.hash_attempts >= self.config.max_hash_attempts {
            report.skipped += 1;
            return Ok(());
        }
        let path = match &record.path {
            Some(path) => path,
            None => {
                report.skipped += 1;
                return Ok(());
            }
        };

        let content_hash = match self.hasher.compute_content_hash(path) {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("Failed to hash {}: {}", path.display(), e);
                self.catalog.record_hash_failure(&record.id)?;
                report.failed += 1;
                return Ok(());
            }
        };
        self.catalog.store_content_hash(&record.id, &content_hash)?;

        let perceptual_hash = match self.hasher.compute_perceptual_hash(path) {
            Ok(hash) => hash,
            Err(e) => {
                // Content hash is already stored; a perceptual failure does
                // not block exact-duplicate grouping.
                log::warn!("Failed to perceptually hash {}: {}", path.display(), e);
                None
            }
        };
        if let Some(phash) = &perceptual_hash {
            self.catalog.store_perceptual_hash(&record.id, phash)?;
        }

        let mut resolved = record.clone();
        resolved.content_hash = Some(content_hash);
        resolved.perceptual_hash = perceptual_hash.or(resolved.perceptual_hash);

        match self.resolver.ensure_asset(&resolved) {
            Ok(_) => report.processed += 1,
            Err(ResolveError::InstanceAssetMismatch { .. }) => {
                log::warn!("Skipping {}: asset link no longer matches file", record.id);
                report.failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

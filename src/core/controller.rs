//! Async orchestration of a full regeneration run: hash backfill, asset
//! resolution, then the four stack phases. One run per project at a time;
//! runs are cancellable and report progress through a shared status handle.

use crate::catalog::{CatalogError, MediaCatalog, MediaFilter};
use crate::core::backfill::{BackfillConfig, BackfillError, HashBackfillWorker};
use crate::core::generator::{
    GenerateError, GenerationReport, GenerationScope, GeneratorParams, StackGenerator,
};
use crate::core::resolver::{AssetResolver, ResolveError};
use crate::database::DbPool;
use crate::services::embedding::EmbeddingStore;
use crate::services::hash::ContentHasher;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegenerationError {
    #[error("A regeneration is already running for project {project_id}")]
    AlreadyRunning { project_id: String },

    #[error("Backfill error: {0}")]
    Backfill(#[from] BackfillError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Generate error: {0}")]
    Generate(#[from] GenerateError),

    #[error("Regeneration task panicked")]
    TaskPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Backfill,
    Resolve,
    Generate,
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub project_id: String,
    pub phase: JobPhase,
    pub hashed: usize,
    pub hash_failures: usize,
    pub resolved: usize,
    pub report: Option<GenerationReport>,
    pub error: Option<String>,
}

impl JobStatus {
    fn new(job_id: &str, project_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            project_id: project_id.to_string(),
            phase: JobPhase::Pending,
            hashed: 0,
            hash_failures: 0,
            resolved: 0,
            report: None,
            error: None,
        }
    }
}

/// Handle to a running regeneration. Dropping it does not cancel the run.
pub struct RegenerationHandle {
    job_id: String,
    status: Arc<Mutex<JobStatus>>,
    cancel: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<Result<GenerationReport, RegenerationError>>,
}

impl RegenerationHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits for the run to finish and returns its report. A cancelled run
    /// still returns `Ok` with the partial report.
    pub async fn wait(self) -> Result<GenerationReport, RegenerationError> {
        match self.join.await {
            Ok(result) => result,
            Err(_) => Err(RegenerationError::TaskPanicked),
        }
    }
}

struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    project_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .expect("running-set lock poisoned")
            .remove(&self.project_id);
    }
}

pub struct RegenerationController {
    pool: DbPool,
    catalog: Arc<dyn MediaCatalog>,
    hasher: Arc<dyn ContentHasher>,
    embeddings: Arc<dyn EmbeddingStore>,
    backfill_config: BackfillConfig,
    running: Arc<Mutex<HashSet<String>>>,
}

impl RegenerationController {
    pub fn new(
        pool: DbPool,
        catalog: Arc<dyn MediaCatalog>,
        hasher: Arc<dyn ContentHasher>,
        embeddings: Arc<dyn EmbeddingStore>,
    ) -> Self {
        Self {
            pool,
            catalog,
            hasher,
            embeddings,
            backfill_config: BackfillConfig::default(),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_backfill_config(mut self, config: BackfillConfig) -> Self {
        self.backfill_config = config;
        self
    }

    /// Starts a regeneration run on the blocking pool. Fails fast on invalid
    /// parameters or when a run for the project is already in flight.
    pub fn regenerate(
        &self,
        project_id: &str,
        scope: GenerationScope,
        params: GeneratorParams,
    ) -> Result<RegenerationHandle, RegenerationError> {
        params.validate()?;

        {
            let mut running = self.running.lock().expect("running-set lock poisoned");
            if !running.insert(project_id.to_string()) {
                return Err(RegenerationError::AlreadyRunning {
                    project_id: project_id.to_string(),
                });
            }
        }
        let guard = RunGuard {
            running: self.running.clone(),
            project_id: project_id.to_string(),
        };

        let job_id = format!("job_{}", Uuid::new_v4().simple());
        let status = Arc::new(Mutex::new(JobStatus::new(&job_id, project_id)));
        let cancel = Arc::new(AtomicBool::new(false));

        let pipeline = Pipeline {
            pool: self.pool.clone(),
            catalog: self.catalog.clone(),
            hasher: self.hasher.clone(),
            embeddings: self.embeddings.clone(),
            backfill_config: self.backfill_config.clone(),
            project_id: project_id.to_string(),
            scope,
            params,
            status: status.clone(),
            cancel: cancel.clone(),
        };

        let join = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = pipeline.run();
            match &result {
                Ok(report) => {
                    let mut status = pipeline.status.lock().expect("status lock poisoned");
                    status.phase = if report.cancelled {
                        JobPhase::Cancelled
                    } else {
                        JobPhase::Complete
                    };
                    status.report = Some(report.clone());
                }
                Err(e) => {
                    log::error!("Regeneration for {} failed: {}", pipeline.project_id, e);
                    let mut status = pipeline.status.lock().expect("status lock poisoned");
                    status.phase = JobPhase::Failed;
                    status.error = Some(e.to_string());
                }
            }
            result
        });

        Ok(RegenerationHandle {
            job_id,
            status,
            cancel,
            join,
        })
    }

    pub fn is_running(&self, project_id: &str) -> bool {
        self.running
            .lock()
            .expect("running-set lock poisoned")
            .contains(project_id)
    }
}

struct Pipeline {
    pool: DbPool,
    catalog: Arc<dyn MediaCatalog>,
    hasher: Arc<dyn ContentHasher>,
    embeddings: Arc<dyn EmbeddingStore>,
    backfill_config: BackfillConfig,
    project_id: String,
    scope: GenerationScope,
    params: GeneratorParams,
    status: Arc<Mutex<JobStatus>>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    fn set_phase(&self, phase: JobPhase) {
        self.status.lock().expect("status lock poisoned").phase = phase;
    }

    fn run(&self) -> Result<GenerationReport, RegenerationError> {
        self.set_phase(JobPhase::Backfill);
        let resolver = AssetResolver::new(self.pool.clone(), self.catalog.clone());
        let worker = HashBackfillWorker::new(
            self.catalog.clone(),
            self.hasher.clone(),
            resolver,
            self.backfill_config.clone(),
        );
        let backfill = worker.run(&self.project_id, &self.cancel, None)?;
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            status.hashed = backfill.processed;
            status.hash_failures = backfill.failed;
        }
        if backfill.cancelled {
            return Ok(GenerationReport {
                cancelled: true,
                ..GenerationReport::default()
            });
        }

        // Re-resolve every hashed record so assets exist for media hashed by
        // earlier runs or by an external ingest.
        self.set_phase(JobPhase::Resolve);
        let resolver = AssetResolver::new(self.pool.clone(), self.catalog.clone());
        let records = self.catalog.list_media(&self.project_id, &MediaFilter::all())?;
        let mut resolved = 0usize;
        for record in &records {
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(GenerationReport {
                    cancelled: true,
                    ..GenerationReport::default()
                });
            }
            if record.content_hash.is_none() {
                continue;
            }
            match resolver.ensure_asset(record) {
                Ok(_) => resolved += 1,
                Err(ResolveError::InstanceAssetMismatch { .. }) => {
                    log::warn!("Skipping {}: asset link no longer matches file", record.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.status.lock().expect("status lock poisoned").resolved = resolved;

        self.set_phase(JobPhase::Generate);
        let generator = StackGenerator::new(
            self.pool.clone(),
            self.catalog.clone(),
            self.embeddings.clone(),
        );
        let report =
            generator.generate(&self.project_id, &self.scope, &self.params, &self.cancel)?;
        Ok(report)
    }
}

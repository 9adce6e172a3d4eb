//! Four-phase stack generation: exact duplicates over content hashes,
//! near-duplicates over perceptual hashes, windowed embedding similarity, and
//! a global cross-date embedding pass. Each phase commits in its own
//! transaction; a cancelled run leaves completed phases intact and never
//! half-writes one.

use crate::catalog::{CatalogError, MediaCatalog, MediaFilter, MediaRecord};
use crate::core::representative::{self, Candidate};
use crate::core::union_find::UnionFind;
use crate::database::models::{MediaAsset, MediaInstance, StackType};
use crate::database::repositories::{
    AssetRepository, InstanceRepository, PendingStack, ReplaceMode, StackMetaRepository,
    StackRepository,
};
use crate::database::{DatabaseError, DbPool};
use crate::services::embedding::{EmbeddingError, EmbeddingStore};
use crate::services::hash::{self, HashError};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Invalid parameter {field}: {message}")]
    InvalidParameter { field: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tunables for one generation run. Serialized canonically into the rule
/// version, so any change produces a new version string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorParams {
    /// Minimum cosine similarity for time-windowed grouping.
    pub similarity_threshold: f32,
    /// Minimum cosine similarity for the global cross-date pass; stricter
    /// than the windowed threshold since time gives no corroboration.
    pub cross_date_threshold: f32,
    /// Capture-time window for phase 3a, in seconds.
    pub window_secs: i64,
    /// A windowed group whose captures all fall within this span is a burst.
    pub burst_window_secs: i64,
    /// Groups below this size are discarded.
    pub min_stack_size: usize,
    /// Maximum perceptual-hash Hamming distance for near-duplicates.
    pub max_hamming_distance: u32,
    /// Row chunk size for the cross-date pairwise pass.
    pub chunk_size: usize,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            cross_date_threshold: 0.85,
            window_secs: 10,
            burst_window_secs: 2,
            min_stack_size: 2,
            max_hamming_distance: 6,
            chunk_size: 512,
        }
    }
}

impl GeneratorParams {
    pub fn validate(&self) -> Result<(), GenerateError> {
        let in_unit = |field: &str, value: f32| -> Result<(), GenerateError> {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(GenerateError::InvalidParameter {
                    field: field.to_string(),
                    message: format!("must be within [0.0, 1.0], got {}", value),
                });
            }
            Ok(())
        };
        in_unit("similarity_threshold", self.similarity_threshold)?;
        in_unit("cross_date_threshold", self.cross_date_threshold)?;

        if self.window_secs <= 0 {
            return Err(GenerateError::InvalidParameter {
                field: "window_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.burst_window_secs <= 0 || self.burst_window_secs > self.window_secs {
            return Err(GenerateError::InvalidParameter {
                field: "burst_window_secs".to_string(),
                message: "must be positive and no larger than window_secs".to_string(),
            });
        }
        if self.min_stack_size < 2 {
            return Err(GenerateError::InvalidParameter {
                field: "min_stack_size".to_string(),
                message: "must be at least 2".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(GenerateError::InvalidParameter {
                field: "chunk_size".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Stable fingerprint of the parameter set. Field order is fixed by the
    /// struct definition, so equal params always yield equal versions.
    pub fn rule_version(&self) -> Result<String, GenerateError> {
        let canonical = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&canonical);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(format!("rv_{}", &hex[..12]))
    }
}

/// What the run covers: everything in the project, or an incremental pass
/// over newly ingested media.
#[derive(Debug, Clone)]
pub enum GenerationScope {
    FullProject,
    NewMedia(HashSet<String>),
}

impl GenerationScope {
    fn replace_mode(&self) -> ReplaceMode {
        match self {
            GenerationScope::FullProject => ReplaceMode::AllOfTypes,
            GenerationScope::NewMedia(_) => ReplaceMode::Overlapping,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PhaseReport {
    pub candidates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stacks_created: usize,
}

#[derive(Debug, Default, Clone)]
pub struct GenerationReport {
    pub rule_version: String,
    pub exact_duplicates: PhaseReport,
    pub near_duplicates: PhaseReport,
    pub windowed_similarity: PhaseReport,
    pub cross_date_similarity: PhaseReport,
    pub cancelled: bool,
}

/// An embedded item entering phase 3: an asset representative or an unhashed
/// but embedded media record.
struct SimItem {
    media_id: String,
    vector: Vec<f32>,
    capture_timestamp: Option<DateTime<Utc>>,
    candidate: Candidate,
}

pub struct StackGenerator {
    stacks: StackRepository,
    assets: AssetRepository,
    instances: InstanceRepository,
    meta: StackMetaRepository,
    catalog: Arc<dyn MediaCatalog>,
    embeddings: Arc<dyn EmbeddingStore>,
}

impl StackGenerator {
    pub fn new(
        pool: DbPool,
        catalog: Arc<dyn MediaCatalog>,
        embeddings: Arc<dyn EmbeddingStore>,
    ) -> Self {
        Self {
            stacks: StackRepository::new(pool.clone()),
            assets: AssetRepository::new(pool.clone()),
            instances: InstanceRepository::new(pool.clone()),
            meta: StackMetaRepository::new(pool),
            catalog,
            embeddings,
        }
    }

    pub fn generate(
        &self,
        project_id: &str,
        scope: &GenerationScope,
        params: &GeneratorParams,
        cancel: &AtomicBool,
    ) -> Result<GenerationReport, GenerateError> {
        params.validate()?;
        let rule_version = params.rule_version()?;
        let params_json = serde_json::to_string(params)?;
        self.meta.upsert(project_id, &rule_version, &params_json)?;

        let mut report = GenerationReport {
            rule_version: rule_version.clone(),
            ..GenerationReport::default()
        };

        let records = self.load_records(project_id)?;
        let assets = self.assets.find_by_project_id(project_id)?;
        let instances = self.instances.find_by_project_id(project_id)?;
        let replace = scope.replace_mode();

        report.exact_duplicates = self.phase_exact_duplicates(
            project_id,
            &rule_version,
            &records,
            &assets,
            &instances,
            scope,
            replace,
        )?;
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            return Ok(report);
        }

        report.near_duplicates = self.phase_near_duplicates(
            project_id,
            &rule_version,
            &records,
            &assets,
            scope,
            params,
            replace,
        )?;
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            return Ok(report);
        }

        let (items, embedding_failures) =
            self.load_sim_items(project_id, &records, &assets, &instances)?;
        report.cross_date_similarity.failed = embedding_failures;
        let (windowed, grouped_ids) = self.phase_windowed_similarity(
            project_id,
            &rule_version,
            &items,
            scope,
            params,
            replace,
        )?;
        report.windowed_similarity = windowed;
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            return Ok(report);
        }

        let mut cross_date = self.phase_cross_date(
            project_id,
            &rule_version,
            &items,
            &grouped_ids,
            scope,
            params,
            cancel,
            &mut report.cancelled,
        )?;
        cross_date.failed += embedding_failures;
        report.cross_date_similarity = cross_date;

        log::info!(
            "Generated stacks for {} under {}: {} duplicate, {} near-duplicate, {} windowed, {} cross-date{}",
            project_id,
            rule_version,
            report.exact_duplicates.stacks_created,
            report.near_duplicates.stacks_created,
            report.windowed_similarity.stacks_created,
            report.cross_date_similarity.stacks_created,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    fn load_records(
        &self,
        project_id: &str,
    ) -> Result<HashMap<String, MediaRecord>, GenerateError> {
        let records = self.catalog.list_media(project_id, &MediaFilter::all())?;
        Ok(records.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    fn candidate_for(
        &self,
        records: &HashMap<String, MediaRecord>,
        media_id: &str,
    ) -> Candidate {
        match records.get(media_id) {
            Some(record) => Candidate::from_record(record),
            None => Candidate::unknown(media_id),
        }
    }

    /// In incremental scope, only groups touching at least one new media id
    /// are (re)committed.
    fn in_scope(&self, scope: &GenerationScope, member_ids: &[&str]) -> bool {
        match scope {
            GenerationScope::FullProject => true,
            GenerationScope::NewMedia(new_ids) => {
                member_ids.iter().any(|id| new_ids.contains(*id))
            }
        }
    }

    /// Orders a group deterministically and builds the pending stack row.
    /// Rank 0 is the representative; every member, the representative
    /// included, carries the strongest edge that connected it.
    fn build_stack(
        &self,
        stack_type: StackType,
        records: &HashMap<String, MediaRecord>,
        member_scores: &[(String, f32)],
    ) -> PendingStack {
        let scores: HashMap<&str, f32> = member_scores
            .iter()
            .map(|(id, score)| (id.as_str(), *score))
            .collect();
        let candidates: Vec<Candidate> = member_scores
            .iter()
            .map(|(id, _)| self.candidate_for(records, id))
            .collect();
        let ranked = representative::rank_candidates(candidates);

        let members = ranked
            .iter()
            .enumerate()
            .map(|(rank, candidate)| {
                let score = scores.get(candidate.media_id.as_str()).copied().unwrap_or(0.0);
                (candidate.media_id.clone(), score, rank as i32)
            })
            .collect();

        PendingStack {
            stack_type,
            representative_media_id: ranked[0].media_id.clone(),
            members,
        }
    }

    /// Phase 1: every asset with two or more instances becomes a duplicate
    /// stack over all of its instance media ids.
    fn phase_exact_duplicates(
        &self,
        project_id: &str,
        rule_version: &str,
        records: &HashMap<String, MediaRecord>,
        assets: &[MediaAsset],
        instances: &[MediaInstance],
        scope: &GenerationScope,
        replace: ReplaceMode,
    ) -> Result<PhaseReport, GenerateError> {
        let mut by_asset: HashMap<&str, Vec<&str>> = HashMap::new();
        for instance in instances {
            by_asset
                .entry(instance.asset_id.as_str())
                .or_default()
                .push(instance.media_id.as_str());
        }

        let mut pending = Vec::new();
        let mut report = PhaseReport::default();
        for asset in assets {
            let members = match by_asset.get(asset.id.as_str()) {
                Some(members) if members.len() >= 2 => members,
                _ => continue,
            };
            report.candidates += 1;
            if !self.in_scope(scope, members) {
                report.skipped += 1;
                continue;
            }
            let scored: Vec<(String, f32)> =
                members.iter().map(|id| (id.to_string(), 1.0)).collect();
            pending.push(self.build_stack(StackType::Duplicate, records, &scored));
        }

        report.stacks_created = self.stacks.commit_phase(
            project_id,
            rule_version,
            &[StackType::Duplicate],
            pending,
            replace,
        )?;
        Ok(report)
    }

    /// Phase 2: near-duplicate grouping over asset perceptual hashes. Hashes
    /// are split into `max_hamming_distance + 1` bands; two hashes within the
    /// distance budget must agree on at least one whole band, so only
    /// band-bucket collisions are compared pairwise.
    fn phase_near_duplicates(
        &self,
        project_id: &str,
        rule_version: &str,
        records: &HashMap<String, MediaRecord>,
        assets: &[MediaAsset],
        scope: &GenerationScope,
        params: &GeneratorParams,
        replace: ReplaceMode,
    ) -> Result<PhaseReport, GenerateError> {
        let mut report = PhaseReport::default();

        let mut hashed: Vec<(&MediaAsset, Vec<u8>)> = Vec::new();
        for asset in assets {
            let tagged = match &asset.perceptual_hash {
                Some(tagged) => tagged,
                None => continue,
            };
            match hash::perceptual_hash_bytes(tagged) {
                Ok(bytes) => hashed.push((asset, bytes)),
                Err(e) => {
                    log::warn!("Ignoring unparseable perceptual hash on {}: {}", asset.id, e);
                    report.failed += 1;
                }
            }
        }
        report.candidates = hashed.len();

        let band_count = (params.max_hamming_distance + 1) as usize;
        let mut buckets: HashMap<(usize, Vec<u8>), Vec<usize>> = HashMap::new();
        for (idx, (_, bytes)) in hashed.iter().enumerate() {
            for (band_idx, band) in split_bands(bytes, band_count).into_iter().enumerate() {
                buckets.entry((band_idx, band)).or_default().push(idx);
            }
        }

        let mut uf = UnionFind::new(hashed.len());
        let mut best_score: HashMap<usize, f32> = HashMap::new();
        let mut seen_pairs: HashSet<(usize, usize)> = HashSet::new();
        for bucket in buckets.values() {
            for (pos, &i) in bucket.iter().enumerate() {
                for &j in &bucket[pos + 1..] {
                    let pair = (i.min(j), i.max(j));
                    if !seen_pairs.insert(pair) {
                        continue;
                    }
                    let (left, _) = &hashed[i];
                    let (right, _) = &hashed[j];
                    let (distance, bits) = match hash::hamming_distance(
                        left.perceptual_hash.as_deref().unwrap_or(""),
                        right.perceptual_hash.as_deref().unwrap_or(""),
                    ) {
                        Ok(result) => result,
                        Err(HashError::VersionMismatch { .. }) => continue,
                        Err(e) => {
                            log::warn!("Perceptual comparison failed: {}", e);
                            continue;
                        }
                    };
                    if distance <= params.max_hamming_distance {
                        uf.union(i, j);
                        let score = 1.0 - distance as f32 / bits as f32;
                        for idx in [i, j] {
                            let entry = best_score.entry(idx).or_insert(0.0);
                            if score > *entry {
                                *entry = score;
                            }
                        }
                    }
                }
            }
        }

        let mut pending = Vec::new();
        for component in uf.components() {
            let member_ids: Vec<&str> = component
                .iter()
                .map(|&idx| hashed[idx].0.representative_media_id.as_str())
                .collect();
            if !self.in_scope(scope, &member_ids) {
                report.skipped += 1;
                continue;
            }
            let scored: Vec<(String, f32)> = component
                .iter()
                .map(|&idx| {
                    (
                        hashed[idx].0.representative_media_id.clone(),
                        best_score.get(&idx).copied().unwrap_or(0.0),
                    )
                })
                .collect();
            pending.push(self.build_stack(StackType::NearDuplicate, records, &scored));
        }

        report.stacks_created = self.stacks.commit_phase(
            project_id,
            rule_version,
            &[StackType::NearDuplicate],
            pending,
            replace,
        )?;
        Ok(report)
    }

    /// Candidates for the embedding phases: one entry per asset (its
    /// representative) plus embedded media that resolved to no asset yet.
    /// Items without an embedding are excluded; corrupt vectors are counted
    /// as failed. Returns the items and the failure count.
    fn load_sim_items(
        &self,
        project_id: &str,
        records: &HashMap<String, MediaRecord>,
        assets: &[MediaAsset],
        instances: &[MediaInstance],
    ) -> Result<(Vec<SimItem>, usize), GenerateError> {
        let linked: HashSet<&str> = instances.iter().map(|i| i.media_id.as_str()).collect();

        let mut candidate_ids: Vec<String> = assets
            .iter()
            .map(|a| a.representative_media_id.clone())
            .collect();
        for record in records.values() {
            if !linked.contains(record.id.as_str()) {
                candidate_ids.push(record.id.clone());
            }
        }
        candidate_ids.sort();
        candidate_ids.dedup();

        let mut vectors = self.embeddings.get_embeddings(project_id, &candidate_ids)?;

        let mut fetched: Vec<(String, Vec<f32>)> = Vec::new();
        for media_id in candidate_ids {
            if let Some(vector) = vectors.remove(&media_id) {
                fetched.push((media_id, vector));
            }
        }

        // Expected dimensionality is the modal vector length of the fetch;
        // a lone corrupt vector must never decide it for everyone else. Ties
        // break toward the smaller length.
        let mut dimension_counts: HashMap<usize, usize> = HashMap::new();
        for (_, vector) in &fetched {
            *dimension_counts.entry(vector.len()).or_insert(0) += 1;
        }
        let expected = dimension_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(len, _)| len);

        let mut items = Vec::new();
        let mut failed = 0usize;
        for (media_id, vector) in fetched {
            if Some(vector.len()) != expected || vector.iter().any(|v| !v.is_finite()) {
                log::warn!("Ignoring malformed embedding for {}", media_id);
                failed += 1;
                continue;
            }
            let candidate = self.candidate_for(records, &media_id);
            items.push(SimItem {
                capture_timestamp: candidate.capture_timestamp,
                candidate,
                media_id,
                vector,
            });
        }
        Ok((items, failed))
    }

    /// Phase 3a: sliding capture-time window. Only timestamped items
    /// participate; pairs within `window_secs` and at or above the similarity
    /// threshold are unioned. Tight all-within-burst-window groups of three
    /// or more become bursts instead of similar stacks.
    fn phase_windowed_similarity(
        &self,
        project_id: &str,
        rule_version: &str,
        items: &[SimItem],
        scope: &GenerationScope,
        params: &GeneratorParams,
        replace: ReplaceMode,
    ) -> Result<(PhaseReport, HashSet<String>), GenerateError> {
        let mut report = PhaseReport::default();

        let mut timed: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.capture_timestamp.is_some())
            .map(|(idx, _)| idx)
            .collect();
        timed.sort_by(|&a, &b| {
            items[a]
                .capture_timestamp
                .cmp(&items[b].capture_timestamp)
                .then_with(|| items[a].media_id.cmp(&items[b].media_id))
        });
        report.candidates = timed.len();

        let mut uf = UnionFind::new(timed.len());
        let mut best_score: HashMap<usize, f32> = HashMap::new();
        for i in 0..timed.len() {
            let ti = items[timed[i]]
                .capture_timestamp
                .map(|t| t.timestamp())
                .unwrap_or(0);
            for j in (i + 1)..timed.len() {
                let tj = items[timed[j]]
                    .capture_timestamp
                    .map(|t| t.timestamp())
                    .unwrap_or(0);
                if tj - ti > params.window_secs {
                    break;
                }
                let score = dot(&items[timed[i]].vector, &items[timed[j]].vector);
                if score >= params.similarity_threshold {
                    uf.union(i, j);
                    for idx in [i, j] {
                        let entry = best_score.entry(idx).or_insert(0.0);
                        if score > *entry {
                            *entry = score;
                        }
                    }
                }
            }
        }

        let mut grouped_ids = HashSet::new();
        let mut pending = Vec::new();
        for component in uf.components() {
            if component.len() < params.min_stack_size {
                continue;
            }
            let member_items: Vec<&SimItem> =
                component.iter().map(|&pos| &items[timed[pos]]).collect();
            for item in &member_items {
                grouped_ids.insert(item.media_id.clone());
            }

            let member_ids: Vec<&str> =
                member_items.iter().map(|item| item.media_id.as_str()).collect();
            if !self.in_scope(scope, &member_ids) {
                report.skipped += 1;
                continue;
            }

            let timestamps: Vec<i64> = member_items
                .iter()
                .filter_map(|item| item.capture_timestamp.map(|t| t.timestamp()))
                .collect();
            let span = match (timestamps.iter().min(), timestamps.iter().max()) {
                (Some(min), Some(max)) => max - min,
                _ => i64::MAX,
            };
            let stack_type = if member_items.len() >= 3 && span < params.burst_window_secs {
                StackType::Burst
            } else {
                StackType::Similar
            };

            let scored: Vec<(String, f32)> = component
                .iter()
                .map(|&pos| {
                    (
                        items[timed[pos]].media_id.clone(),
                        best_score.get(&pos).copied().unwrap_or(0.0),
                    )
                })
                .collect();
            pending.push(self.rebuild_with_items(stack_type, &member_items, &scored));
        }

        report.stacks_created = self.stacks.commit_phase(
            project_id,
            rule_version,
            &[StackType::Similar, StackType::Burst],
            pending,
            replace,
        )?;
        Ok((report, grouped_ids))
    }

    fn rebuild_with_items(
        &self,
        stack_type: StackType,
        member_items: &[&SimItem],
        scores: &[(String, f32)],
    ) -> PendingStack {
        let score_map: HashMap<&str, f32> = scores
            .iter()
            .map(|(id, score)| (id.as_str(), *score))
            .collect();
        let candidates: Vec<Candidate> = member_items
            .iter()
            .map(|item| item.candidate.clone())
            .collect();
        let ranked = representative::rank_candidates(candidates);
        let members = ranked
            .iter()
            .enumerate()
            .map(|(rank, candidate)| {
                let score = score_map
                    .get(candidate.media_id.as_str())
                    .copied()
                    .unwrap_or(0.0);
                (candidate.media_id.clone(), score, rank as i32)
            })
            .collect();
        PendingStack {
            stack_type,
            representative_media_id: ranked[0].media_id.clone(),
            members,
        }
    }

    /// Phase 3b: global pairwise pass over everything phase 3a left
    /// ungrouped, including timestamp-less items. Chunked so cancellation is
    /// honored between chunks; similarity rows are computed in parallel and
    /// merged single-threaded.
    #[allow(clippy::too_many_arguments)]
    fn phase_cross_date(
        &self,
        project_id: &str,
        rule_version: &str,
        items: &[SimItem],
        grouped_ids: &HashSet<String>,
        scope: &GenerationScope,
        params: &GeneratorParams,
        cancel: &AtomicBool,
        cancelled: &mut bool,
    ) -> Result<PhaseReport, GenerateError> {
        let mut report = PhaseReport::default();

        let eligible: Vec<&SimItem> = items
            .iter()
            .filter(|item| !grouped_ids.contains(&item.media_id))
            .collect();
        report.candidates = eligible.len();

        let mut uf = UnionFind::new(eligible.len());
        let mut best_score: HashMap<usize, f32> = HashMap::new();
        for chunk_start in (0..eligible.len()).step_by(params.chunk_size) {
            if cancel.load(Ordering::Relaxed) {
                // Abandon the phase without committing partial output.
                *cancelled = true;
                return Ok(report);
            }
            let chunk_end = (chunk_start + params.chunk_size).min(eligible.len());

            let edges: Vec<(usize, usize, f32)> = (chunk_start..chunk_end)
                .into_par_iter()
                .flat_map_iter(|i| {
                    let row: Vec<(usize, usize, f32)> = ((i + 1)..eligible.len())
                        .filter_map(|j| {
                            let score = dot(&eligible[i].vector, &eligible[j].vector);
                            if score >= params.cross_date_threshold {
                                Some((i, j, score))
                            } else {
                                None
                            }
                        })
                        .collect();
                    row.into_iter()
                })
                .collect();

            for (i, j, score) in edges {
                uf.union(i, j);
                for idx in [i, j] {
                    let entry = best_score.entry(idx).or_insert(0.0);
                    if score > *entry {
                        *entry = score;
                    }
                }
            }
        }

        let mut pending = Vec::new();
        for component in uf.components() {
            if component.len() < params.min_stack_size {
                continue;
            }
            let member_items: Vec<&SimItem> =
                component.iter().map(|&pos| eligible[pos]).collect();
            let member_ids: Vec<&str> =
                member_items.iter().map(|item| item.media_id.as_str()).collect();
            if !self.in_scope(scope, &member_ids) {
                report.skipped += 1;
                continue;
            }
            let scored: Vec<(String, f32)> = component
                .iter()
                .map(|&pos| {
                    (
                        eligible[pos].media_id.clone(),
                        best_score.get(&pos).copied().unwrap_or(0.0),
                    )
                })
                .collect();
            pending.push(self.rebuild_with_items(StackType::Similar, &member_items, &scored));
        }

        report.stacks_created = self.stacks.commit_phase(
            project_id,
            rule_version,
            &[StackType::Similar],
            pending,
            ReplaceMode::Overlapping,
        )?;
        Ok(report)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Splits hash bytes into `band_count` contiguous slices. With distance
/// budget `d` and `d + 1` bands, any pair within the budget shares at least
/// one unchanged band (pigeonhole), so band equality is a sound prefilter.
fn split_bands(bytes: &[u8], band_count: usize) -> Vec<Vec<u8>> {
    let band_count = band_count.max(1).min(bytes.len().max(1));
    let base = bytes.len() / band_count;
    let remainder = bytes.len() % band_count;

    let mut bands = Vec::with_capacity(band_count);
    let mut offset = 0;
    for idx in 0..band_count {
        let len = base + usize::from(idx < remainder);
        bands.push(bytes[offset..offset + len].to_vec());
        offset += len;
    }
    bands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::core::resolver::AssetResolver;
    use crate::database::repositories::test_support::{test_pool, test_project};
    use crate::services::embedding::InMemoryEmbeddingStore;
    use chrono::TimeZone;

    fn record(
        id: &str,
        project_id: &str,
        content_hash: &str,
        perceptual_hash: Option<&str>,
        ts: Option<i64>,
    ) -> MediaRecord {
        MediaRecord {
            id: id.to_string(),
            project_id: project_id.to_string(),
            path: None,
            capture_timestamp: ts.map(|secs| Utc.timestamp_opt(secs, 0).unwrap()),
            width: 1920,
            height: 1080,
            file_size: 4096,
            content_hash: Some(content_hash.to_string()),
            perceptual_hash: perceptual_hash.map(String::from),
            hash_attempts: 0,
            source_device: None,
        }
    }

    struct Fixture {
        project_id: String,
        catalog: Arc<InMemoryCatalog>,
        embeddings: Arc<InMemoryEmbeddingStore>,
        resolver: AssetResolver,
        generator: StackGenerator,
        stacks: StackRepository,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let (dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let catalog = Arc::new(InMemoryCatalog::new());
        let embeddings = Arc::new(InMemoryEmbeddingStore::new());
        let resolver = AssetResolver::new(pool.clone(), catalog.clone());
        let generator =
            StackGenerator::new(pool.clone(), catalog.clone(), embeddings.clone());
        let stacks = StackRepository::new(pool);
        Fixture {
            project_id,
            catalog,
            embeddings,
            resolver,
            generator,
            stacks,
            _dir: dir,
        }
    }

    fn resolve(fx: &Fixture, record: &MediaRecord) {
        fx.catalog.insert(record.clone());
        fx.resolver.ensure_asset(record).unwrap();
    }

    fn run(fx: &Fixture, params: &GeneratorParams) -> GenerationReport {
        let cancel = AtomicBool::new(false);
        fx.generator
            .generate(
                &fx.project_id,
                &GenerationScope::FullProject,
                params,
                &cancel,
            )
            .unwrap()
    }

    fn stacks_of(fx: &Fixture, stack_type: StackType) -> Vec<Vec<String>> {
        let stacks = fx
            .stacks
            .find_by_project_id(&fx.project_id, Some(stack_type))
            .unwrap();
        let mut result: Vec<Vec<String>> = stacks
            .iter()
            .map(|s| {
                fx.stacks
                    .get_members(&s.id)
                    .unwrap()
                    .into_iter()
                    .map(|m| m.media_id)
                    .collect()
            })
            .collect();
        result.sort();
        result
    }

    #[test]
    fn test_rule_version_is_stable_and_param_sensitive() {
        let params = GeneratorParams::default();
        let v1 = params.rule_version().unwrap();
        let v2 = params.rule_version().unwrap();
        assert_eq!(v1, v2);
        assert!(v1.starts_with("rv_"));
        assert_eq!(v1.len(), 15);

        let mut other = GeneratorParams::default();
        other.window_secs = 30;
        assert_ne!(v1, other.rule_version().unwrap());
    }

    #[test]
    fn test_param_validation() {
        let mut params = GeneratorParams::default();
        params.similarity_threshold = 1.5;
        assert!(matches!(
            params.validate(),
            Err(GenerateError::InvalidParameter { .. })
        ));

        let mut params = GeneratorParams::default();
        params.min_stack_size = 1;
        assert!(params.validate().is_err());

        let mut params = GeneratorParams::default();
        params.burst_window_secs = params.window_secs + 1;
        assert!(params.validate().is_err());

        assert!(GeneratorParams::default().validate().is_ok());
    }

    #[test]
    fn test_exact_duplicates_are_complete() {
        let fx = fixture();
        // Three identical files plus one distinct.
        resolve(&fx, &record("m1", &fx.project_id, "hash_a", None, Some(100)));
        resolve(&fx, &record("m2", &fx.project_id, "hash_a", None, Some(200)));
        resolve(&fx, &record("m3", &fx.project_id, "hash_a", None, Some(300)));
        resolve(&fx, &record("m4", &fx.project_id, "hash_b", None, Some(400)));

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.exact_duplicates.stacks_created, 1);

        let duplicate_stacks = stacks_of(&fx, StackType::Duplicate);
        assert_eq!(duplicate_stacks, vec![vec!["m1", "m2", "m3"]]);
    }

    #[test]
    fn test_generation_is_idempotent() {
        let fx = fixture();
        resolve(&fx, &record("m1", &fx.project_id, "hash_a", None, Some(100)));
        resolve(&fx, &record("m2", &fx.project_id, "hash_a", None, Some(200)));

        let params = GeneratorParams::default();
        run(&fx, &params);
        run(&fx, &params);

        let stacks = fx.stacks.find_by_project_id(&fx.project_id, None).unwrap();
        assert_eq!(stacks.len(), 1);
        let members = fx.stacks.get_members(&stacks[0].id).unwrap();
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn test_near_duplicates_group_within_hamming_budget() {
        let fx = fixture();
        let zeros = format!("v1:{}", image_hash_base64(&[0u8; 8]));
        // 4 bits away from zeros
        let close = format!("v1:{}", image_hash_base64(&[0b0000_1111, 0, 0, 0, 0, 0, 0, 0]));
        // Far from both
        let far = format!("v1:{}", image_hash_base64(&[0xFF; 8]));

        resolve(
            &fx,
            &record("m1", &fx.project_id, "hash_a", Some(&zeros), Some(100)),
        );
        resolve(
            &fx,
            &record("m2", &fx.project_id, "hash_b", Some(&close), Some(200)),
        );
        resolve(
            &fx,
            &record("m3", &fx.project_id, "hash_c", Some(&far), Some(300)),
        );
        resolve(
            &fx,
            &record("m4", &fx.project_id, "hash_d", Some("garbage"), Some(400)),
        );

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.near_duplicates.stacks_created, 1);
        assert_eq!(report.near_duplicates.failed, 1);
        assert_eq!(
            stacks_of(&fx, StackType::NearDuplicate),
            vec![vec!["m1", "m2"]]
        );

        // 4 differing bits out of 64: both members record the edge score.
        let stacks = fx
            .stacks
            .find_by_project_id(&fx.project_id, Some(StackType::NearDuplicate))
            .unwrap();
        let members = fx.stacks.get_members(&stacks[0].id).unwrap();
        assert!(members.iter().all(|m| m.similarity_score == 0.9375));
    }

    #[test]
    fn test_burst_detection_in_window_phase() {
        let fx = fixture();
        // Three near-identical shots at 0/1/2 seconds: within the window,
        // within the burst span.
        for (id, hash, ts) in [("m1", "h1", 0), ("m2", "h2", 1), ("m3", "h3", 2)] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, Some(ts)));
            fx.embeddings.insert(id, vec![1.0, 0.0, 0.0]);
        }

        let mut params = GeneratorParams::default();
        params.burst_window_secs = 3;
        params.window_secs = 10;
        let report = run(&fx, &params);

        assert_eq!(report.windowed_similarity.stacks_created, 1);
        assert_eq!(stacks_of(&fx, StackType::Burst), vec![vec!["m1", "m2", "m3"]]);
        assert!(stacks_of(&fx, StackType::Similar).is_empty());
    }

    #[test]
    fn test_windowed_group_wider_than_burst_span_is_similar() {
        let fx = fixture();
        // 0/2/4 seconds: within the 10s window but spanning more than the
        // default 2s burst span.
        for (id, hash, ts) in [("m1", "h1", 0), ("m2", "h2", 2), ("m3", "h3", 4)] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, Some(ts)));
            fx.embeddings.insert(id, vec![1.0, 0.0, 0.0]);
        }

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.windowed_similarity.stacks_created, 1);
        assert_eq!(
            stacks_of(&fx, StackType::Similar),
            vec![vec!["m1", "m2", "m3"]]
        );
        assert!(stacks_of(&fx, StackType::Burst).is_empty());
    }

    #[test]
    fn test_windowed_similarity_respects_window() {
        let fx = fixture();
        // Identical embeddings but captured an hour apart: not windowed.
        for (id, hash, ts) in [("m1", "h1", 0), ("m2", "h2", 3600)] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, Some(ts)));
            fx.embeddings.insert(id, vec![0.0, 1.0]);
        }

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.windowed_similarity.stacks_created, 0);
        // The global pass still groups them.
        assert_eq!(report.cross_date_similarity.stacks_created, 1);
        assert_eq!(stacks_of(&fx, StackType::Similar), vec![vec!["m1", "m2"]]);
    }

    #[test]
    fn test_cross_date_groups_across_years() {
        let fx = fixture();
        let jan_2023 = Utc.with_ymd_and_hms(2023, 1, 15, 12, 0, 0).unwrap().timestamp();
        let jan_2024 = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap().timestamp();

        for (id, hash, ts, vector) in [
            ("m1", "h1", jan_2023, vec![0.6, 0.8]),
            ("m2", "h2", jan_2024, vec![0.6, 0.8]),
            ("m3", "h3", jan_2024, vec![1.0, 0.0]),
        ] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, Some(ts)));
            fx.embeddings.insert(id, vector);
        }

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.windowed_similarity.stacks_created, 0);
        assert_eq!(report.cross_date_similarity.stacks_created, 1);
        assert_eq!(stacks_of(&fx, StackType::Similar), vec![vec!["m1", "m2"]]);
    }

    #[test]
    fn test_cross_date_threshold_boundary() {
        let fx = fixture();
        let threshold = GeneratorParams::default().cross_date_threshold;
        let below = f32::from_bits(threshold.to_bits() - 1);

        // m1·m2 lands exactly on the threshold; m3·m4 one bit below it. The
        // pairs live in orthogonal planes so there are no cross edges.
        for (id, hash, vector) in [
            ("m1", "h1", vec![1.0, 0.0, 0.0, 0.0]),
            (
                "m2",
                "h2",
                vec![threshold, (1.0 - threshold * threshold).sqrt(), 0.0, 0.0],
            ),
            ("m3", "h3", vec![0.0, 0.0, 1.0, 0.0]),
            (
                "m4",
                "h4",
                vec![0.0, 0.0, below, (1.0 - below * below).sqrt()],
            ),
        ] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, None));
            fx.embeddings.insert(id, vector);
        }

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.cross_date_similarity.stacks_created, 1);
        assert_eq!(stacks_of(&fx, StackType::Similar), vec![vec!["m1", "m2"]]);
    }

    #[test]
    fn test_items_without_embeddings_are_excluded() {
        let fx = fixture();
        resolve(&fx, &record("m1", &fx.project_id, "h1", None, Some(0)));
        resolve(&fx, &record("m2", &fx.project_id, "h2", None, Some(1)));
        fx.embeddings.insert("m1", vec![1.0, 0.0]);
        // m2 has no embedding.

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.windowed_similarity.stacks_created, 0);
        assert_eq!(report.cross_date_similarity.stacks_created, 0);
    }

    #[test]
    fn test_mismatched_dimensions_are_skipped() {
        let fx = fixture();
        for (id, hash) in [("m1", "h1"), ("m2", "h2"), ("m3", "h3")] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, None));
        }
        fx.embeddings.insert("m1", vec![1.0, 0.0]);
        fx.embeddings.insert("m2", vec![1.0, 0.0]);
        fx.embeddings.insert("m3", vec![1.0, 0.0, 0.0]);

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.cross_date_similarity.candidates, 2);
        assert_eq!(report.cross_date_similarity.failed, 1);
        assert_eq!(stacks_of(&fx, StackType::Similar), vec![vec!["m1", "m2"]]);
    }

    #[test]
    fn test_corrupt_first_vector_does_not_poison_dimension() {
        let fx = fixture();
        // The wrong-dimension vector belongs to the first-sorted media id;
        // the dominant dimensionality must still win and the valid pair must
        // still group.
        for (id, hash) in [("m0", "h0"), ("m1", "h1"), ("m2", "h2")] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, None));
        }
        fx.embeddings.insert("m0", vec![1.0, 0.0, 0.0]);
        fx.embeddings.insert("m1", vec![1.0, 0.0]);
        fx.embeddings.insert("m2", vec![1.0, 0.0]);

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.cross_date_similarity.candidates, 2);
        assert_eq!(report.cross_date_similarity.failed, 1);
        assert_eq!(stacks_of(&fx, StackType::Similar), vec![vec!["m1", "m2"]]);
    }

    #[test]
    fn test_non_finite_vector_is_counted_failed() {
        let fx = fixture();
        for (id, hash) in [("m1", "h1"), ("m2", "h2"), ("m3", "h3")] {
            resolve(&fx, &record(id, &fx.project_id, hash, None, None));
        }
        fx.embeddings.insert("m1", vec![1.0, 0.0]);
        fx.embeddings.insert("m2", vec![1.0, 0.0]);
        fx.embeddings.insert("m3", vec![f32::NAN, 0.0]);

        let report = run(&fx, &GeneratorParams::default());
        assert_eq!(report.cross_date_similarity.failed, 1);
        assert_eq!(stacks_of(&fx, StackType::Similar), vec![vec!["m1", "m2"]]);
    }

    #[test]
    fn test_representative_rank_and_scores() {
        let fx = fixture();
        let mut high_res = record("m1", &fx.project_id, "h1", None, Some(0));
        high_res.width = 3840;
        high_res.height = 2160;
        let low_res = record("m2", &fx.project_id, "h2", None, Some(1));
        resolve(&fx, &high_res);
        resolve(&fx, &low_res);
        fx.embeddings.insert("m1", vec![1.0, 0.0]);
        fx.embeddings.insert("m2", vec![1.0, 0.0]);

        run(&fx, &GeneratorParams::default());

        let stacks = fx
            .stacks
            .find_by_project_id(&fx.project_id, Some(StackType::Similar))
            .unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].representative_media_id, "m1");
        let members = fx.stacks.get_members(&stacks[0].id).unwrap();
        assert_eq!(members[0].media_id, "m1");
        assert_eq!(members[0].rank, 0);
        assert_eq!(members[0].similarity_score, 1.0);
        assert_eq!(members[1].media_id, "m2");
        assert!(members[1].similarity_score > 0.99);
    }

    #[test]
    fn test_cancellation_preserves_completed_phases() {
        let fx = fixture();
        resolve(&fx, &record("m1", &fx.project_id, "hash_a", None, Some(0)));
        resolve(&fx, &record("m2", &fx.project_id, "hash_a", None, Some(1)));

        let cancel = AtomicBool::new(true);
        let report = fx
            .generator
            .generate(
                &fx.project_id,
                &GenerationScope::FullProject,
                &GeneratorParams::default(),
                &cancel,
            )
            .unwrap();

        assert!(report.cancelled);
        // Phase 1 committed before the cancel check.
        assert_eq!(report.exact_duplicates.stacks_created, 1);
        assert_eq!(stacks_of(&fx, StackType::Duplicate).len(), 1);
        assert!(stacks_of(&fx, StackType::NearDuplicate).is_empty());
    }

    #[test]
    fn test_incremental_scope_skips_untouched_groups() {
        let fx = fixture();
        resolve(&fx, &record("m1", &fx.project_id, "hash_a", None, Some(0)));
        resolve(&fx, &record("m2", &fx.project_id, "hash_a", None, Some(1)));
        resolve(&fx, &record("m3", &fx.project_id, "hash_b", None, Some(2)));
        resolve(&fx, &record("m4", &fx.project_id, "hash_b", None, Some(3)));

        let params = GeneratorParams::default();
        run(&fx, &params);
        assert_eq!(stacks_of(&fx, StackType::Duplicate).len(), 2);

        // A new copy of hash_a arrives; the hash_b stack must survive the
        // incremental run untouched.
        resolve(&fx, &record("m5", &fx.project_id, "hash_a", None, Some(4)));
        let cancel = AtomicBool::new(false);
        let scope = GenerationScope::NewMedia(HashSet::from(["m5".to_string()]));
        fx.generator
            .generate(&fx.project_id, &scope, &params, &cancel)
            .unwrap();

        let duplicate_stacks = stacks_of(&fx, StackType::Duplicate);
        assert_eq!(duplicate_stacks.len(), 2);
        assert!(duplicate_stacks
            .iter()
            .any(|s| s == &vec!["m1", "m2", "m5"]));
        assert!(duplicate_stacks.iter().any(|s| s == &vec!["m3", "m4"]));
    }

    #[test]
    fn test_meta_row_written_per_rule_version() {
        let fx = fixture();
        resolve(&fx, &record("m1", &fx.project_id, "hash_a", None, None));

        let params = GeneratorParams::default();
        let report = run(&fx, &params);

        let meta = fx
            .generator
            .meta
            .find_by_rule_version(&fx.project_id, &report.rule_version)
            .unwrap();
        assert!(meta.is_some());
        let stored: GeneratorParams =
            serde_json::from_str(&meta.unwrap().params).unwrap();
        assert_eq!(stored.window_secs, params.window_secs);
    }

    #[test]
    fn test_split_bands_covers_all_bytes() {
        let bytes: Vec<u8> = (0..8).collect();
        let bands = split_bands(&bytes, 7);
        assert_eq!(bands.len(), 7);
        let total: usize = bands.iter().map(|b| b.len()).sum();
        assert_eq!(total, 8);
        let rejoined: Vec<u8> = bands.into_iter().flatten().collect();
        assert_eq!(rejoined, bytes);
    }

    fn image_hash_base64(bytes: &[u8]) -> String {
        let hash: image_hasher::ImageHash<Box<[u8]>> =
            image_hasher::ImageHash::from_bytes(bytes).unwrap();
        hash.to_base64()
    }
}

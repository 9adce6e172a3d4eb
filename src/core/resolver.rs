//! Content-addressable identity: maps hashed media records onto assets and
//! instances. One asset per distinct `(project, content_hash)`, one instance
//! per media record, representative re-evaluated on every new link.

use crate::catalog::{CatalogError, MediaCatalog, MediaRecord};
use crate::core::representative::{self, Candidate};
use crate::database::repositories::{AssetRepository, InstanceRepository, Repository};
use crate::database::{DatabaseError, DbPool};
use diesel::Connection;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(
        "Media {media_id} is linked to asset {linked_asset_id} but its content hash \
         {content_hash} now maps to asset {expected_asset_id}"
    )]
    InstanceAssetMismatch {
        media_id: String,
        linked_asset_id: String,
        content_hash: String,
        expected_asset_id: String,
    },
}

pub struct AssetResolver {
    assets: AssetRepository,
    instances: InstanceRepository,
    catalog: Arc<dyn MediaCatalog>,
}

impl AssetResolver {
    pub fn new(pool: DbPool, catalog: Arc<dyn MediaCatalog>) -> Self {
        Self {
            assets: AssetRepository::new(pool.clone()),
            instances: InstanceRepository::new(pool),
            catalog,
        }
    }

    pub fn assets(&self) -> &AssetRepository {
        &self.assets
    }

    pub fn instances(&self) -> &InstanceRepository {
        &self.instances
    }

    /// Resolves one media record to its asset, creating the asset and
    /// instance rows as needed. Returns the asset id, or `None` when the
    /// record has no content hash yet. Idempotent: re-resolving an already
    /// linked record is a no-op apart from the representative check.
    pub fn ensure_asset(&self, record: &MediaRecord) -> Result<Option<String>, ResolveError> {
        let content_hash = match &record.content_hash {
            Some(hash) => hash,
            None => return Ok(None),
        };

        if let Some(existing) = self
            .instances
            .find_by_media_id(&record.project_id, &record.id)?
        {
            let asset = self.assets.find_by_id(&existing.asset_id)?;
            if asset.content_hash != *content_hash {
                // The file changed on disk after it was linked. Surface it
                // instead of silently re-linking.
                let expected = self
                    .assets
                    .find_by_content_hash(&record.project_id, content_hash)?
                    .map(|a| a.id)
                    .unwrap_or_else(|| "<none>".to_string());
                return Err(ResolveError::InstanceAssetMismatch {
                    media_id: record.id.clone(),
                    linked_asset_id: existing.asset_id,
                    content_hash: content_hash.clone(),
                    expected_asset_id: expected,
                });
            }
            self.refresh_representative(&asset.id, &asset.representative_media_id)?;
            return Ok(Some(asset.id));
        }

        // One transaction for the asset, its perceptual-hash backfill and the
        // instance link. An asset row must never land without an instance
        // referencing it.
        let mut conn = self.assets.get_connection()?;
        let asset = conn.transaction::<_, DatabaseError, _>(|conn| {
            let asset = AssetRepository::upsert_in(
                conn,
                &record.project_id,
                content_hash,
                record.perceptual_hash.clone(),
                &record.id,
            )?;

            // A record carrying a perceptual hash can arrive after the asset
            // was first created from one that had none.
            if asset.perceptual_hash.is_none() {
                if let Some(phash) = &record.perceptual_hash {
                    AssetRepository::update_perceptual_hash_in(conn, &asset.id, phash)?;
                }
            }

            InstanceRepository::upsert_in(
                conn,
                &record.project_id,
                &asset.id,
                &record.id,
                record.source_device.clone(),
                record.path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                record.file_size as i64,
            )?;

            Ok(asset)
        })?;
        drop(conn);

        self.refresh_representative(&asset.id, &asset.representative_media_id)?;
        Ok(Some(asset.id))
    }

    /// Re-selects the asset representative across every linked instance. A
    /// full re-scan rather than a champion comparison, so the result never
    /// depends on link order.
    fn refresh_representative(
        &self,
        asset_id: &str,
        current: &str,
    ) -> Result<(), ResolveError> {
        let linked = self.instances.find_by_asset_id(asset_id)?;
        let mut candidates = Vec::with_capacity(linked.len());
        for instance in &linked {
            match self.catalog.get_media(&instance.media_id)? {
                Some(record) => candidates.push(Candidate::from_record(&record)),
                None => {
                    log::warn!(
                        "Media {} linked to asset {} is missing from the catalog",
                        instance.media_id,
                        asset_id
                    );
                    candidates.push(Candidate::unknown(&instance.media_id));
                }
            }
        }

        if let Some(best) = representative::select_representative(&candidates) {
            if best.media_id != current {
                self.assets
                    .update_representative(asset_id, &best.media_id)?;
            }
        }
        Ok(())
    }
}

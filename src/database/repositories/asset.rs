use super::Repository;
use crate::database::models::{MediaAsset, NewMediaAsset};
use crate::database::{DatabaseError, DbPool};
use crate::schema::media_assets;
use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

pub struct AssetRepository {
    pool: DbPool,
}

impl Repository for AssetRepository {
    fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl AssetRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts an asset for `(project_id, content_hash)` if none exists yet
    /// and returns the surviving row either way. The unique constraint makes
    /// concurrent callers converge on a single asset.
    pub fn upsert(
        &self,
        project_id: &str,
        content_hash: &str,
        perceptual_hash: Option<String>,
        representative_media_id: &str,
    ) -> Result<MediaAsset, DatabaseError> {
        let mut conn = self.get_connection()?;
        Self::upsert_in(
            &mut conn,
            project_id,
            content_hash,
            perceptual_hash,
            representative_media_id,
        )
    }

    /// `upsert` on a caller-provided connection, so it can join a larger
    /// transaction.
    pub(crate) fn upsert_in(
        conn: &mut SqliteConnection,
        project_id: &str,
        content_hash: &str,
        perceptual_hash: Option<String>,
        representative_media_id: &str,
    ) -> Result<MediaAsset, DatabaseError> {
        let now = Utc::now().to_rfc3339();

        let new_asset = NewMediaAsset {
            id: format!("ast_{}", Uuid::new_v4().simple()),
            project_id: project_id.to_string(),
            content_hash: content_hash.to_string(),
            perceptual_hash,
            representative_media_id: representative_media_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };

        diesel::insert_into(media_assets::table)
            .values(&new_asset)
            .on_conflict((media_assets::project_id, media_assets::content_hash))
            .do_nothing()
            .execute(conn)?;

        media_assets::table
            .filter(media_assets::project_id.eq(project_id))
            .filter(media_assets::content_hash.eq(content_hash))
            .select(MediaAsset::as_select())
            .first(conn)
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_id(&self, id: &str) -> Result<MediaAsset, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_assets::table
            .filter(media_assets::id.eq(id))
            .select(MediaAsset::as_select())
            .first(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_content_hash(
        &self,
        project_id: &str,
        content_hash: &str,
    ) -> Result<Option<MediaAsset>, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_assets::table
            .filter(media_assets::project_id.eq(project_id))
            .filter(media_assets::content_hash.eq(content_hash))
            .select(MediaAsset::as_select())
            .first(&mut conn)
            .optional()
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_project_id(&self, project_id: &str) -> Result<Vec<MediaAsset>, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_assets::table
            .filter(media_assets::project_id.eq(project_id))
            .order(media_assets::id.asc())
            .select(MediaAsset::as_select())
            .load(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn update_representative(
        &self,
        id: &str,
        representative_media_id: &str,
    ) -> Result<MediaAsset, DatabaseError> {
        let mut conn = self.get_connection()?;
        let now = Utc::now().to_rfc3339();

        diesel::update(media_assets::table.filter(media_assets::id.eq(id)))
            .set((
                media_assets::representative_media_id.eq(representative_media_id),
                media_assets::updated_at.eq(now),
            ))
            .execute(&mut conn)?;

        self.find_by_id(id)
    }

    pub fn update_perceptual_hash(
        &self,
        id: &str,
        perceptual_hash: &str,
    ) -> Result<MediaAsset, DatabaseError> {
        let mut conn = self.get_connection()?;
        Self::update_perceptual_hash_in(&mut conn, id, perceptual_hash)?;
        self.find_by_id(id)
    }

    pub(crate) fn update_perceptual_hash_in(
        conn: &mut SqliteConnection,
        id: &str,
        perceptual_hash: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();

        diesel::update(media_assets::table.filter(media_assets::id.eq(id)))
            .set((
                media_assets::perceptual_hash.eq(perceptual_hash),
                media_assets::updated_at.eq(now),
            ))
            .execute(conn)?;

        Ok(())
    }

    pub fn count_by_project_id(&self, project_id: &str) -> Result<i64, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_assets::table
            .filter(media_assets::project_id.eq(project_id))
            .count()
            .get_result(&mut conn)
            .map_err(DatabaseError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::test_support::{test_pool, test_project};

    #[test]
    fn test_upsert_creates_once() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = AssetRepository::new(pool);

        let first = repo.upsert(&project_id, "hash_a", None, "m1").unwrap();
        assert!(first.id.starts_with("ast_"));
        assert_eq!(first.representative_media_id, "m1");

        // Second upsert with the same hash returns the existing asset and
        // leaves the representative alone.
        let second = repo.upsert(&project_id, "hash_a", None, "m2").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.representative_media_id, "m1");

        assert_eq!(repo.count_by_project_id(&project_id).unwrap(), 1);
    }

    #[test]
    fn test_distinct_hashes_distinct_assets() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = AssetRepository::new(pool);

        repo.upsert(&project_id, "hash_a", None, "m1").unwrap();
        repo.upsert(&project_id, "hash_b", None, "m2").unwrap();

        assert_eq!(repo.count_by_project_id(&project_id).unwrap(), 2);
    }

    #[test]
    fn test_update_representative() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = AssetRepository::new(pool);

        let asset = repo.upsert(&project_id, "hash_a", None, "m1").unwrap();
        let updated = repo.update_representative(&asset.id, "m2").unwrap();
        assert_eq!(updated.representative_media_id, "m2");
    }

    #[test]
    fn test_update_perceptual_hash() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = AssetRepository::new(pool);

        let asset = repo.upsert(&project_id, "hash_a", None, "m1").unwrap();
        let updated = repo.update_perceptual_hash(&asset.id, "v1:AAAA").unwrap();
        assert_eq!(updated.perceptual_hash, Some("v1:AAAA".to_string()));
    }
}

use super::Repository;
use crate::database::models::{MediaInstance, NewMediaInstance};
use crate::database::{DatabaseError, DbPool};
use crate::schema::media_instances;
use diesel::prelude::*;
use uuid::Uuid;

pub struct InstanceRepository {
    pool: DbPool,
}

impl Repository for InstanceRepository {
    fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl InstanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Links `media_id` to `asset_id` if no instance exists for
    /// `(project_id, media_id)` yet and returns the surviving row. A media
    /// record is linked to at most one asset.
    pub fn upsert(
        &self,
        project_id: &str,
        asset_id: &str,
        media_id: &str,
        source_device: Option<String>,
        source_path: Option<String>,
        file_size: i64,
    ) -> Result<MediaInstance, DatabaseError> {
        let mut conn = self.get_connection()?;
        Self::upsert_in(
            &mut conn,
            project_id,
            asset_id,
            media_id,
            source_device,
            source_path,
            file_size,
        )
    }

    /// `upsert` on a caller-provided connection, so it can join a larger
    /// transaction.
    pub(crate) fn upsert_in(
        conn: &mut SqliteConnection,
        project_id: &str,
        asset_id: &str,
        media_id: &str,
        source_device: Option<String>,
        source_path: Option<String>,
        file_size: i64,
    ) -> Result<MediaInstance, DatabaseError> {
        let new_instance = NewMediaInstance {
            id: format!("ins_{}", Uuid::new_v4().simple()),
            project_id: project_id.to_string(),
            asset_id: asset_id.to_string(),
            media_id: media_id.to_string(),
            source_device,
            source_path,
            file_size,
        };

        diesel::insert_into(media_instances::table)
            .values(&new_instance)
            .on_conflict((media_instances::project_id, media_instances::media_id))
            .do_nothing()
            .execute(conn)?;

        media_instances::table
            .filter(media_instances::project_id.eq(project_id))
            .filter(media_instances::media_id.eq(media_id))
            .select(MediaInstance::as_select())
            .first(conn)
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_media_id(
        &self,
        project_id: &str,
        media_id: &str,
    ) -> Result<Option<MediaInstance>, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_instances::table
            .filter(media_instances::project_id.eq(project_id))
            .filter(media_instances::media_id.eq(media_id))
            .select(MediaInstance::as_select())
            .first(&mut conn)
            .optional()
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_asset_id(&self, asset_id: &str) -> Result<Vec<MediaInstance>, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_instances::table
            .filter(media_instances::asset_id.eq(asset_id))
            .order(media_instances::media_id.asc())
            .select(MediaInstance::as_select())
            .load(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_project_id(
        &self,
        project_id: &str,
    ) -> Result<Vec<MediaInstance>, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_instances::table
            .filter(media_instances::project_id.eq(project_id))
            .order(media_instances::media_id.asc())
            .select(MediaInstance::as_select())
            .load(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn count_by_asset_id(&self, asset_id: &str) -> Result<i64, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_instances::table
            .filter(media_instances::asset_id.eq(asset_id))
            .count()
            .get_result(&mut conn)
            .map_err(DatabaseError::Query)
    }
}

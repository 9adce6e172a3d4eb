//! Top-level facade wiring the database pool, catalog, hashers and embedding
//! store together. Library consumers go through this; the inner repositories
//! and workers stay reachable for anything the facade does not cover.

use crate::catalog::MediaCatalog;
use crate::core::controller::{RegenerationController, RegenerationError, RegenerationHandle};
use crate::core::generator::{GenerationScope, GeneratorParams};
use crate::database::models::{MediaStack, MediaStackMember, Project, StackCreator, StackType};
use crate::database::repositories::{
    ProjectRepository, StackRepository, StackSummary,
};
use crate::database::{establish_connection, DatabaseError, DbPool};
use crate::services::embedding::EmbeddingStore;
use crate::services::hash::ContentHasher;
use std::sync::Arc;

pub struct StackEngine {
    pool: DbPool,
    projects: ProjectRepository,
    stacks: StackRepository,
    controller: RegenerationController,
}

impl StackEngine {
    pub fn new(
        database_url: &str,
        catalog: Arc<dyn MediaCatalog>,
        hasher: Arc<dyn ContentHasher>,
        embeddings: Arc<dyn EmbeddingStore>,
    ) -> Result<Self, DatabaseError> {
        let pool = establish_connection(database_url)?;
        Ok(Self::with_pool(pool, catalog, hasher, embeddings))
    }

    pub fn with_pool(
        pool: DbPool,
        catalog: Arc<dyn MediaCatalog>,
        hasher: Arc<dyn ContentHasher>,
        embeddings: Arc<dyn EmbeddingStore>,
    ) -> Self {
        let controller =
            RegenerationController::new(pool.clone(), catalog, hasher, embeddings);
        Self {
            projects: ProjectRepository::new(pool.clone()),
            stacks: StackRepository::new(pool.clone()),
            pool,
            controller,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn create_project(&self, name: &str) -> Result<Project, DatabaseError> {
        self.projects.create(name.to_string())
    }

    pub fn delete_project(&self, project_id: &str) -> Result<bool, DatabaseError> {
        self.projects.delete(project_id)
    }

    /// Starts a full or incremental regeneration; at most one run per
    /// project at a time.
    pub fn regenerate(
        &self,
        project_id: &str,
        scope: GenerationScope,
        params: GeneratorParams,
    ) -> Result<RegenerationHandle, RegenerationError> {
        self.controller.regenerate(project_id, scope, params)
    }

    pub fn is_regenerating(&self, project_id: &str) -> bool {
        self.controller.is_running(project_id)
    }

    pub fn list_stacks(
        &self,
        project_id: &str,
        stack_type: Option<StackType>,
    ) -> Result<Vec<StackSummary>, DatabaseError> {
        self.stacks.list_summaries(project_id, stack_type)
    }

    /// Members ordered by rank; rank 0 is the representative.
    pub fn get_stack_members(
        &self,
        stack_id: &str,
    ) -> Result<Vec<MediaStackMember>, DatabaseError> {
        self.stacks.get_members(stack_id)
    }

    /// Creates a manual stack that regeneration will never delete.
    pub fn create_user_stack(
        &self,
        project_id: &str,
        stack_type: StackType,
        representative_media_id: &str,
        media_ids: &[String],
    ) -> Result<MediaStack, DatabaseError> {
        let members = media_ids
            .iter()
            .enumerate()
            .map(|(rank, media_id)| (media_id.clone(), 1.0, rank as i32))
            .collect();
        self.stacks.create(
            project_id,
            stack_type,
            StackCreator::User,
            "manual",
            representative_media_id,
            members,
        )
    }
}

use super::Repository;
use crate::database::models::Project;
use crate::database::{DatabaseError, DbPool};
use crate::schema::projects;
use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

pub struct ProjectRepository {
    pool: DbPool,
}

impl Repository for ProjectRepository {
    fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl ProjectRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create(&self, name: String) -> Result<Project, DatabaseError> {
        let mut conn = self.get_connection()?;
        let now = Utc::now().to_rfc3339();
        let id = format!("prj_{}", Uuid::new_v4().simple());

        let project = Project {
            id: id.clone(),
            name,
            created_at: now.clone(),
            updated_at: now,
        };

        diesel::insert_into(projects::table)
            .values(&project)
            .execute(&mut conn)?;

        self.find_by_id(&id)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Project, DatabaseError> {
        let mut conn = self.get_connection()?;

        projects::table
            .filter(projects::id.eq(id))
            .select(Project::as_select())
            .first(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn exists(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut conn = self.get_connection()?;

        let count: i64 = projects::table
            .filter(projects::id.eq(id))
            .count()
            .get_result(&mut conn)?;

        Ok(count > 0)
    }

    /// Deletes the project row; instances, assets, stacks, members and meta
    /// go with it via foreign key cascade.
    pub fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut conn = self.get_connection()?;

        let deleted_count =
            diesel::delete(projects::table.filter(projects::id.eq(id))).execute(&mut conn)?;

        Ok(deleted_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::test_support::test_pool;

    #[test]
    fn test_create_and_find_project() {
        let (_dir, pool) = test_pool();
        let repo = ProjectRepository::new(pool);

        let project = repo.create("Library 2024".to_string()).unwrap();
        assert!(project.id.starts_with("prj_"));
        assert_eq!(project.name, "Library 2024");

        let found = repo.find_by_id(&project.id).unwrap();
        assert_eq!(found.name, "Library 2024");
    }

    #[test]
    fn test_delete_project() {
        let (_dir, pool) = test_pool();
        let repo = ProjectRepository::new(pool);

        let project = repo.create("Short-lived".to_string()).unwrap();
        assert!(repo.delete(&project.id).unwrap());
        assert!(!repo.exists(&project.id).unwrap());
        assert!(!repo.delete(&project.id).unwrap());
    }
}

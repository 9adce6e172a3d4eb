use super::Repository;
use crate::database::models::{NewStackMeta, StackMeta};
use crate::database::{DatabaseError, DbPool};
use crate::schema::stack_meta;
use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

pub struct StackMetaRepository {
    pool: DbPool,
}

impl Repository for StackMetaRepository {
    fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl StackMetaRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Records the parameter set behind a rule version. Re-running with the
    /// same parameters keeps the original audit row.
    pub fn upsert(
        &self,
        project_id: &str,
        rule_version: &str,
        params: &str,
    ) -> Result<StackMeta, DatabaseError> {
        let mut conn = self.get_connection()?;

        let new_meta = NewStackMeta {
            id: format!("meta_{}", Uuid::new_v4().simple()),
            project_id: project_id.to_string(),
            rule_version: rule_version.to_string(),
            params: params.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        diesel::insert_into(stack_meta::table)
            .values(&new_meta)
            .on_conflict((stack_meta::project_id, stack_meta::rule_version))
            .do_nothing()
            .execute(&mut conn)?;

        stack_meta::table
            .filter(stack_meta::project_id.eq(project_id))
            .filter(stack_meta::rule_version.eq(rule_version))
            .select(StackMeta::as_select())
            .first(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_rule_version(
        &self,
        project_id: &str,
        rule_version: &str,
    ) -> Result<Option<StackMeta>, DatabaseError> {
        let mut conn = self.get_connection()?;

        stack_meta::table
            .filter(stack_meta::project_id.eq(project_id))
            .filter(stack_meta::rule_version.eq(rule_version))
            .select(StackMeta::as_select())
            .first(&mut conn)
            .optional()
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_project_id(&self, project_id: &str) -> Result<Vec<StackMeta>, DatabaseError> {
        let mut conn = self.get_connection()?;

        stack_meta::table
            .filter(stack_meta::project_id.eq(project_id))
            .order(stack_meta::created_at.desc())
            .select(StackMeta::as_select())
            .load(&mut conn)
            .map_err(DatabaseError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::test_support::{test_pool, test_project};

    #[test]
    fn test_upsert_keeps_first_row() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackMetaRepository::new(pool);

        let first = repo
            .upsert(&project_id, "rv_abc", r#"{"window_secs":10}"#)
            .unwrap();
        let second = repo
            .upsert(&project_id, "rv_abc", r#"{"window_secs":10}"#)
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.params, r#"{"window_secs":10}"#);
    }

    #[test]
    fn test_lookup_missing_rule_version() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackMetaRepository::new(pool);

        assert!(repo
            .find_by_rule_version(&project_id, "rv_missing")
            .unwrap()
            .is_none());
    }
}

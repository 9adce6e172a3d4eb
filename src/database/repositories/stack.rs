use super::Repository;
use crate::database::models::{
    MediaStack, MediaStackMember, NewMediaStack, StackCreator, StackType,
};
use crate::database::{DatabaseError, DbPool};
use crate::schema::{media_stack_members, media_stacks};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Bounds bind-parameter count per INSERT; SQLite's default limit is 999.
const INSERT_CHUNK_ROWS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSummary {
    pub id: String,
    pub stack_type: String,
    pub representative_media_id: String,
    pub member_count: i64,
}

/// A stack plus its members, ready to persist. Member rows carry an empty
/// `stack_id`; the repository fills it in on insert.
#[derive(Debug)]
pub struct PendingStack {
    pub stack_type: StackType,
    pub representative_media_id: String,
    pub members: Vec<(String, f32, i32)>, // (media_id, similarity_score, rank)
}

/// How a phase commit treats existing system stacks of the same types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Delete every system stack of the phase's types in the project first
    /// (full-project regeneration).
    AllOfTypes,
    /// Delete only system stacks of the phase's types that share a member
    /// with the incoming stacks (incremental regeneration).
    Overlapping,
}

pub struct StackRepository {
    pool: DbPool,
}

impl Repository for StackRepository {
    fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl StackRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create(
        &self,
        project_id: &str,
        stack_type: StackType,
        creator: StackCreator,
        rule_version: &str,
        representative_media_id: &str,
        members: Vec<(String, f32, i32)>,
    ) -> Result<MediaStack, DatabaseError> {
        let mut conn = self.get_connection()?;
        let id = format!("stk_{}", Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();

        let new_stack = NewMediaStack {
            id: id.clone(),
            project_id: project_id.to_string(),
            stack_type: String::from(stack_type),
            representative_media_id: representative_media_id.to_string(),
            rule_version: rule_version.to_string(),
            created_by: String::from(creator),
            created_at: now,
        };

        conn.transaction::<_, DatabaseError, _>(|conn| {
            diesel::insert_into(media_stacks::table)
                .values(&new_stack)
                .execute(conn)?;

            let member_rows: Vec<MediaStackMember> = members
                .into_iter()
                .map(|(media_id, similarity_score, rank)| MediaStackMember {
                    stack_id: id.clone(),
                    media_id,
                    similarity_score,
                    rank,
                })
                .collect();

            for chunk in member_rows.chunks(INSERT_CHUNK_ROWS) {
                diesel::insert_into(media_stack_members::table)
                    .values(chunk)
                    .execute(conn)?;
            }

            Ok(())
        })?;

        self.find_by_id(&id)
    }

    /// Persists one generation phase's output in a single transaction:
    /// replaced stacks are deleted and new ones inserted together, so a
    /// cancelled phase leaves no partial output behind.
    pub fn commit_phase(
        &self,
        project_id: &str,
        rule_version: &str,
        phase_types: &[StackType],
        stacks: Vec<PendingStack>,
        replace: ReplaceMode,
    ) -> Result<usize, DatabaseError> {
        let mut conn = self.get_connection()?;
        let now = Utc::now().to_rfc3339();
        let type_strings: Vec<String> = phase_types.iter().map(|t| String::from(*t)).collect();

        conn.transaction::<_, DatabaseError, _>(|conn| {
            let doomed: Vec<String> = match replace {
                ReplaceMode::AllOfTypes => media_stacks::table
                    .filter(media_stacks::project_id.eq(project_id))
                    .filter(media_stacks::stack_type.eq_any(&type_strings))
                    .filter(media_stacks::created_by.eq(String::from(StackCreator::System)))
                    .select(media_stacks::id)
                    .load(conn)?,
                ReplaceMode::Overlapping => {
                    let incoming_media: Vec<&str> = stacks
                        .iter()
                        .flat_map(|s| s.members.iter().map(|(media_id, _, _)| media_id.as_str()))
                        .collect();
                    if incoming_media.is_empty() {
                        Vec::new()
                    } else {
                        media_stacks::table
                            .inner_join(media_stack_members::table)
                            .filter(media_stacks::project_id.eq(project_id))
                            .filter(media_stacks::stack_type.eq_any(&type_strings))
                            .filter(
                                media_stacks::created_by.eq(String::from(StackCreator::System)),
                            )
                            .filter(media_stack_members::media_id.eq_any(incoming_media))
                            .select(media_stacks::id)
                            .distinct()
                            .load(conn)?
                    }
                }
            };

            if !doomed.is_empty() {
                diesel::delete(
                    media_stack_members::table
                        .filter(media_stack_members::stack_id.eq_any(&doomed)),
                )
                .execute(conn)?;
                diesel::delete(media_stacks::table.filter(media_stacks::id.eq_any(&doomed)))
                    .execute(conn)?;
            }

            let mut stack_rows = Vec::with_capacity(stacks.len());
            let mut member_rows = Vec::new();
            for stack in stacks {
                let id = format!("stk_{}", Uuid::new_v4().simple());
                stack_rows.push(NewMediaStack {
                    id: id.clone(),
                    project_id: project_id.to_string(),
                    stack_type: String::from(stack.stack_type),
                    representative_media_id: stack.representative_media_id,
                    rule_version: rule_version.to_string(),
                    created_by: String::from(StackCreator::System),
                    created_at: now.clone(),
                });
                for (media_id, similarity_score, rank) in stack.members {
                    member_rows.push(MediaStackMember {
                        stack_id: id.clone(),
                        media_id,
                        similarity_score,
                        rank,
                    });
                }
            }

            for chunk in stack_rows.chunks(INSERT_CHUNK_ROWS) {
                diesel::insert_into(media_stacks::table)
                    .values(chunk)
                    .execute(conn)?;
            }
            for chunk in member_rows.chunks(INSERT_CHUNK_ROWS) {
                diesel::insert_into(media_stack_members::table)
                    .values(chunk)
                    .execute(conn)?;
            }

            Ok(stack_rows.len())
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<MediaStack, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_stacks::table
            .filter(media_stacks::id.eq(id))
            .select(MediaStack::as_select())
            .first(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn find_by_project_id(
        &self,
        project_id: &str,
        stack_type: Option<StackType>,
    ) -> Result<Vec<MediaStack>, DatabaseError> {
        let mut conn = self.get_connection()?;

        let mut query = media_stacks::table
            .filter(media_stacks::project_id.eq(project_id))
            .into_boxed();
        if let Some(stack_type) = stack_type {
            query = query.filter(media_stacks::stack_type.eq(String::from(stack_type)));
        }

        query
            .order(media_stacks::id.asc())
            .select(MediaStack::as_select())
            .load(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn list_summaries(
        &self,
        project_id: &str,
        stack_type: Option<StackType>,
    ) -> Result<Vec<StackSummary>, DatabaseError> {
        let stacks = self.find_by_project_id(project_id, stack_type)?;
        let mut conn = self.get_connection()?;

        let ids: Vec<String> = stacks.iter().map(|s| s.id.clone()).collect();
        let counts: Vec<(String, i64)> = media_stack_members::table
            .filter(media_stack_members::stack_id.eq_any(&ids))
            .group_by(media_stack_members::stack_id)
            .select((
                media_stack_members::stack_id,
                diesel::dsl::count(media_stack_members::media_id),
            ))
            .load(&mut conn)?;
        let counts: std::collections::HashMap<String, i64> = counts.into_iter().collect();

        Ok(stacks
            .into_iter()
            .map(|s| StackSummary {
                member_count: counts.get(&s.id).copied().unwrap_or(0),
                id: s.id,
                stack_type: s.stack_type,
                representative_media_id: s.representative_media_id,
            })
            .collect())
    }

    /// Members of a stack ordered by rank; rank 0 is the representative.
    pub fn get_members(&self, stack_id: &str) -> Result<Vec<MediaStackMember>, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_stack_members::table
            .filter(media_stack_members::stack_id.eq(stack_id))
            .order(media_stack_members::rank.asc())
            .select(MediaStackMember::as_select())
            .load(&mut conn)
            .map_err(DatabaseError::Query)
    }

    pub fn count_by_project_id(&self, project_id: &str) -> Result<i64, DatabaseError> {
        let mut conn = self.get_connection()?;

        media_stacks::table
            .filter(media_stacks::project_id.eq(project_id))
            .count()
            .get_result(&mut conn)
            .map_err(DatabaseError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::test_support::{test_pool, test_project};

    fn pending(stack_type: StackType, members: &[(&str, f32)]) -> PendingStack {
        PendingStack {
            stack_type,
            representative_media_id: members[0].0.to_string(),
            members: members
                .iter()
                .enumerate()
                .map(|(rank, (media_id, score))| (media_id.to_string(), *score, rank as i32))
                .collect(),
        }
    }

    #[test]
    fn test_commit_phase_inserts_stacks_and_members() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackRepository::new(pool);

        let created = repo
            .commit_phase(
                &project_id,
                "rv_test",
                &[StackType::Duplicate],
                vec![pending(
                    StackType::Duplicate,
                    &[("m1", 1.0), ("m2", 1.0), ("m3", 1.0)],
                )],
                ReplaceMode::AllOfTypes,
            )
            .unwrap();
        assert_eq!(created, 1);

        let stacks = repo
            .find_by_project_id(&project_id, Some(StackType::Duplicate))
            .unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].representative_media_id, "m1");
        assert_eq!(stacks[0].rule_version, "rv_test");

        let members = repo.get_members(&stacks[0].id).unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].rank, 0);
        assert_eq!(members[0].media_id, "m1");
        assert_eq!(members[2].media_id, "m3");
    }

    #[test]
    fn test_commit_phase_replaces_system_stacks_of_type() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackRepository::new(pool);

        repo.commit_phase(
            &project_id,
            "rv_old",
            &[StackType::Duplicate],
            vec![pending(StackType::Duplicate, &[("m1", 1.0), ("m2", 1.0)])],
            ReplaceMode::AllOfTypes,
        )
        .unwrap();
        repo.commit_phase(
            &project_id,
            "rv_new",
            &[StackType::Duplicate],
            vec![pending(StackType::Duplicate, &[("m1", 1.0), ("m4", 1.0)])],
            ReplaceMode::AllOfTypes,
        )
        .unwrap();

        let stacks = repo.find_by_project_id(&project_id, None).unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].rule_version, "rv_new");
    }

    #[test]
    fn test_commit_phase_preserves_user_stacks() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackRepository::new(pool);

        let user_stack = repo
            .create(
                &project_id,
                StackType::Duplicate,
                StackCreator::User,
                "rv_manual",
                "m9",
                vec![("m9".to_string(), 1.0, 0), ("m10".to_string(), 1.0, 1)],
            )
            .unwrap();

        repo.commit_phase(
            &project_id,
            "rv_new",
            &[StackType::Duplicate],
            vec![pending(StackType::Duplicate, &[("m9", 1.0), ("m10", 1.0)])],
            ReplaceMode::AllOfTypes,
        )
        .unwrap();

        let stacks = repo.find_by_project_id(&project_id, None).unwrap();
        assert_eq!(stacks.len(), 2);
        assert!(stacks.iter().any(|s| s.id == user_stack.id));
    }

    #[test]
    fn test_commit_phase_overlapping_only_deletes_touched_stacks() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackRepository::new(pool);

        repo.commit_phase(
            &project_id,
            "rv_1",
            &[StackType::Similar],
            vec![
                pending(StackType::Similar, &[("m1", 0.95), ("m2", 0.95)]),
                pending(StackType::Similar, &[("m3", 0.93), ("m4", 0.93)]),
            ],
            ReplaceMode::AllOfTypes,
        )
        .unwrap();

        // Incremental run touching only m1/m2; the m3/m4 stack must survive.
        repo.commit_phase(
            &project_id,
            "rv_1",
            &[StackType::Similar],
            vec![pending(
                StackType::Similar,
                &[("m1", 0.95), ("m2", 0.95), ("m5", 0.94)],
            )],
            ReplaceMode::Overlapping,
        )
        .unwrap();

        let summaries = repo.list_summaries(&project_id, None).unwrap();
        assert_eq!(summaries.len(), 2);
        let counts: Vec<i64> = {
            let mut c: Vec<i64> = summaries.iter().map(|s| s.member_count).collect();
            c.sort();
            c
        };
        assert_eq!(counts, vec![2, 3]);
    }

    #[test]
    fn test_list_summaries_counts_members() {
        let (_dir, pool) = test_pool();
        let project_id = test_project(&pool);
        let repo = StackRepository::new(pool);

        repo.commit_phase(
            &project_id,
            "rv_1",
            &[StackType::Burst],
            vec![pending(
                StackType::Burst,
                &[("m1", 1.0), ("m2", 0.95), ("m3", 0.95)],
            )],
            ReplaceMode::AllOfTypes,
        )
        .unwrap();

        let summaries = repo.list_summaries(&project_id, Some(StackType::Burst)).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].member_count, 3);
        assert_eq!(summaries[0].stack_type, "burst");
    }
}

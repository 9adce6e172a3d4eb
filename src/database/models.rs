use crate::schema::*;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

// Project models
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = projects)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

// Asset models: one row per unique (project, content hash)
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = media_assets)]
pub struct MediaAsset {
    pub id: String,
    pub project_id: String,
    pub content_hash: String,
    pub perceptual_hash: Option<String>,
    pub representative_media_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = media_assets)]
pub struct NewMediaAsset {
    pub id: String,
    pub project_id: String,
    pub content_hash: String,
    pub perceptual_hash: Option<String>,
    pub representative_media_id: String,
    pub created_at: String,
    pub updated_at: String,
}

// Instance models: one row per physical occurrence of an asset
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = media_instances)]
pub struct MediaInstance {
    pub id: String,
    pub project_id: String,
    pub asset_id: String,
    pub media_id: String,
    pub source_device: Option<String>,
    pub source_path: Option<String>,
    pub file_size: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = media_instances)]
pub struct NewMediaInstance {
    pub id: String,
    pub project_id: String,
    pub asset_id: String,
    pub media_id: String,
    pub source_device: Option<String>,
    pub source_path: Option<String>,
    pub file_size: i64,
}

// Stack models
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = media_stacks)]
pub struct MediaStack {
    pub id: String,
    pub project_id: String,
    pub stack_type: String,
    pub representative_media_id: String,
    pub rule_version: String,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = media_stacks)]
pub struct NewMediaStack {
    pub id: String,
    pub project_id: String,
    pub stack_type: String,
    pub representative_media_id: String,
    pub rule_version: String,
    pub created_by: String,
    pub created_at: String,
}

// Stack membership: rank 0 is the representative
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = media_stack_members)]
pub struct MediaStackMember {
    pub stack_id: String,
    pub media_id: String,
    pub similarity_score: f32,
    pub rank: i32,
}

// Parameter set a generation run was produced with
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = stack_meta)]
pub struct StackMeta {
    pub id: String,
    pub project_id: String,
    pub rule_version: String,
    pub params: String,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = stack_meta)]
pub struct NewStackMeta {
    pub id: String,
    pub project_id: String,
    pub rule_version: String,
    pub params: String,
    pub created_at: String,
}

// Enums for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackType {
    Duplicate,
    NearDuplicate,
    Similar,
    Burst,
}

impl From<String> for StackType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "duplicate" => StackType::Duplicate,
            "near_duplicate" => StackType::NearDuplicate,
            "similar" => StackType::Similar,
            "burst" => StackType::Burst,
            _ => StackType::Similar,
        }
    }
}

impl From<StackType> for String {
    fn from(stack_type: StackType) -> Self {
        match stack_type {
            StackType::Duplicate => "duplicate".to_string(),
            StackType::NearDuplicate => "near_duplicate".to_string(),
            StackType::Similar => "similar".to_string(),
            StackType::Burst => "burst".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackCreator {
    System,
    User,
    Ml,
}

impl From<String> for StackCreator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "system" => StackCreator::System,
            "user" => StackCreator::User,
            "ml" => StackCreator::Ml,
            _ => StackCreator::System,
        }
    }
}

impl From<StackCreator> for String {
    fn from(creator: StackCreator) -> Self {
        match creator {
            StackCreator::System => "system".to_string(),
            StackCreator::User => "user".to_string(),
            StackCreator::Ml => "ml".to_string(),
        }
    }
}

//! Duplicate and similarity grouping for personal media libraries.
//!
//! Media files are resolved to content-addressable assets (one per distinct
//! file content), then grouped into stacks by four passes: exact duplicates
//! over content hashes, near-duplicates over perceptual hashes, capture-time
//! windowed embedding similarity, and a global cross-date embedding pass.
//! Stacks are stored in SQLite and regenerated wholesale per rule version;
//! user-created stacks are never touched.

pub mod catalog;
pub mod core;
pub mod database;
pub mod engine;
pub mod schema;
pub mod services;

pub use crate::catalog::{CatalogError, InMemoryCatalog, MediaCatalog, MediaFilter, MediaRecord};
pub use crate::core::{
    BackfillConfig, BackfillReport, GenerateError, GenerationReport, GenerationScope,
    GeneratorParams, JobPhase, JobStatus, RegenerationError, RegenerationHandle,
};
pub use crate::database::models::{MediaStack, MediaStackMember, Project, StackCreator, StackType};
pub use crate::database::repositories::StackSummary;
pub use crate::database::{establish_connection, DatabaseError, DbPool};
pub use crate::engine::StackEngine;
pub use crate::services::{ContentHasher, EmbeddingStore, FileHasher, InMemoryEmbeddingStore};

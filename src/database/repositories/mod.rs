pub mod asset;
pub mod instance;
pub mod project;
pub mod stack;
pub mod stack_meta;

pub use asset::AssetRepository;
pub use instance::InstanceRepository;
pub use project::ProjectRepository;
pub use stack::{PendingStack, ReplaceMode, StackRepository, StackSummary};
pub use stack_meta::StackMetaRepository;

use super::{DatabaseError, DbConnection, DbPool};

pub trait Repository {
    fn pool(&self) -> &DbPool;

    fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        self.pool()
            .get()
            .map_err(|e| DatabaseError::Migration(format!("Pool connection failed: {}", e)))
    }
}

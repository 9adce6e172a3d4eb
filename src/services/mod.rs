pub mod embedding;
pub mod hash;

pub use embedding::{EmbeddingError, EmbeddingStore, InMemoryEmbeddingStore};
pub use hash::{ContentHasher, FileHasher, HashError};

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Embedding backend error: {0}")]
    Backend(String),
}

/// Injected embedding dependency. Vectors are computed elsewhere; this crate
/// only consumes them. Vectors are expected to be L2-normalized with a fixed
/// dimensionality per project, so cosine similarity reduces to a dot product.
pub trait EmbeddingStore: Send + Sync {
    fn get_embeddings(
        &self,
        project_id: &str,
        media_ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, EmbeddingError>;
}

/// Store backed by a process-local map; serves tests and embedded setups.
pub struct InMemoryEmbeddingStore {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl InMemoryEmbeddingStore {
    pub fn new() -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, media_id: &str, vector: Vec<f32>) {
        self.vectors
            .write()
            .expect("embedding lock poisoned")
            .insert(media_id.to_string(), vector);
    }
}

impl Default for InMemoryEmbeddingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingStore for InMemoryEmbeddingStore {
    fn get_embeddings(
        &self,
        _project_id: &str,
        media_ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, EmbeddingError> {
        let vectors = self.vectors.read().expect("embedding lock poisoned");
        Ok(media_ids
            .iter()
            .filter_map(|id| vectors.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }
}

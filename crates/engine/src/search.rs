//! Semantic search over the chunk store.

use std::sync::Arc;

use ipc::SearchHit;
use tracing::debug;

use crate::{
  pool::{EmbedderPool, PoolError},
  store::{StoreError, VectorStore},
};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
  #[error("Embedding failed: {0}")]
  Embed(#[from] PoolError),
  #[error("Store error: {0}")]
  Store(#[from] StoreError),
}

/// Embed the query (E5 query mode) and run a cosine nearest-neighbour
/// search. Scores map distance to similarity: `score = 1 - distance`.
pub async fn search(
  store: &VectorStore,
  pool: &Arc<EmbedderPool>,
  query: &str,
  k: usize,
) -> Result<Vec<SearchHit>, SearchError> {
  debug!(query_len = query.len(), k, "Semantic search");

  let mut vectors = pool.embed(vec![query.to_string()], true).await?;
  let query_vector = vectors.pop().unwrap_or_default();

  let hits = store.vector_search(&query_vector, k).await?;
  Ok(
    hits
      .into_iter()
      .map(|(row, distance)| SearchHit {
        path: row.path,
        text: row.text,
        score: 1.0 - distance,
        offset: row.offset,
        page: row.page,
      })
      .collect(),
  )
}

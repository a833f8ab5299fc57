//! Vector store: the `chunks` table and its schema.
//!
//! All writes go through the write queue; there is a single writer at a
//! time. Chunk ids are deterministic (path + offset), so at-least-once
//! commits never produce duplicate visible state: a re-run deletes the
//! file's rows before adding the fresh set.

use std::{path::Path, sync::Arc};

use arrow_array::{
  Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray,
  UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::{
  Connection, connect,
  query::{ExecutableQuery, QueryBase},
};
use tracing::{debug, error, info};

pub const CHUNKS_TABLE: &str = "chunks";
pub const FILE_STATUS_TABLE: &str = "file_status";

/// Vector dimension of the default model (e5-base family).
pub const DEFAULT_VECTOR_DIM: usize = 768;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Missing column: {0}")]
  MissingColumn(&'static str),
  #[error("Vector dimension mismatch: expected {expected}, got {got}")]
  DimensionMismatch { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One row of the `chunks` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
  pub id: String,
  pub path: String,
  pub text: String,
  pub offset: u64,
  pub page: Option<i32>,
  pub chunk_type: String,
  pub title: Option<String>,
  pub mtime: i64,
  pub vector: Vec<f32>,
}

impl ChunkRow {
  /// Derive the deterministic row id from path and offset.
  pub fn derive_id(path: &str, offset: u64) -> String {
    semdex_core::chunk_id(path, offset)
  }
}

/// Schema for the chunks table.
pub fn chunks_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("path", DataType::Utf8, false),
    Field::new("text", DataType::Utf8, false),
    Field::new("offset", DataType::UInt64, false),
    Field::new("page", DataType::Int32, true),
    Field::new("chunk_type", DataType::Utf8, false),
    Field::new("title", DataType::Utf8, true),
    Field::new("mtime", DataType::Int64, false),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      false,
    ),
  ]))
}

/// Schema for the file-status catalogue table.
pub fn file_status_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("path", DataType::Utf8, false),
    Field::new("status", DataType::Utf8, false),
    Field::new("file_hash", DataType::Utf8, false),
    Field::new("parser_version", DataType::Int32, false),
    Field::new("chunk_count", DataType::UInt64, false),
    Field::new("last_modified", DataType::Int64, false),
    Field::new("indexed_at", DataType::Int64, false),
    Field::new("last_retry", DataType::Int64, true),
    Field::new("error_message", DataType::Utf8, true),
  ]))
}

/// Connection to the on-disk store.
pub struct VectorStore {
  pub connection: Connection,
  pub vector_dim: usize,
}

impl VectorStore {
  /// Open (or create) the store at `db_dir` and ensure tables exist.
  pub async fn open(db_dir: &Path, vector_dim: usize) -> Result<Self> {
    tokio::fs::create_dir_all(db_dir).await?;

    info!(path = %db_dir.display(), vector_dim, "Opening vector store");
    let connection = match connect(db_dir.to_string_lossy().as_ref()).execute().await {
      Ok(conn) => conn,
      Err(e) => {
        error!(path = %db_dir.display(), err = %e, "Failed to open vector store");
        return Err(e.into());
      }
    };

    let store = Self {
      connection,
      vector_dim,
    };
    store.ensure_tables().await?;
    Ok(store)
  }

  async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    debug!(existing_tables = table_names.len(), "Checking required tables");

    if !table_names.contains(&CHUNKS_TABLE.to_string()) {
      debug!("Creating chunks table");
      self
        .connection
        .create_empty_table(CHUNKS_TABLE, chunks_schema(self.vector_dim))
        .execute()
        .await?;
    }

    if !table_names.contains(&FILE_STATUS_TABLE.to_string()) {
      debug!("Creating file_status table");
      self
        .connection
        .create_empty_table(FILE_STATUS_TABLE, file_status_schema())
        .execute()
        .await?;
    }

    Ok(())
  }

  pub async fn chunks_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(CHUNKS_TABLE).execute().await?)
  }

  pub async fn file_status_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(FILE_STATUS_TABLE).execute().await?)
  }

  /// Batch insert chunk rows.
  pub async fn add_chunks(&self, rows: &[ChunkRow]) -> Result<()> {
    if rows.is_empty() {
      return Ok(());
    }

    for row in rows {
      if row.vector.len() != self.vector_dim {
        return Err(StoreError::DimensionMismatch {
          expected: self.vector_dim,
          got: row.vector.len(),
        });
      }
    }

    let table = self.chunks_table().await?;
    let batch = chunks_to_batch(rows, self.vector_dim)?;
    let iter = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema(self.vector_dim));
    table.add(Box::new(iter)).execute().await?;
    Ok(())
  }

  /// Delete every chunk belonging to a path.
  pub async fn delete_chunks_for_path(&self, path: &str) -> Result<()> {
    debug!(table = CHUNKS_TABLE, path = %path, "Deleting chunks for path");
    let table = self.chunks_table().await?;
    table.delete(&format!("path = '{}'", escape_sql(path))).await?;
    Ok(())
  }

  /// All chunks stored for a path, ordered by offset.
  pub async fn chunks_for_path(&self, path: &str) -> Result<Vec<ChunkRow>> {
    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_sql(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut rows = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        rows.push(batch_to_chunk(&batch, i, self.vector_dim)?);
      }
    }
    rows.sort_by_key(|r| r.offset);
    Ok(rows)
  }

  pub async fn count_chunks(&self) -> Result<usize> {
    let table = self.chunks_table().await?;
    Ok(table.count_rows(None).await?)
  }

  /// Cosine nearest-neighbour search.
  pub async fn vector_search(&self, query_vector: &[f32], k: usize) -> Result<Vec<(ChunkRow, f32)>> {
    if query_vector.len() != self.vector_dim {
      return Err(StoreError::DimensionMismatch {
        expected: self.vector_dim,
        got: query_vector.len(),
      });
    }

    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .vector_search(query_vector.to_vec())?
      .distance_type(lancedb::DistanceType::Cosine)
      .limit(k)
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut hits = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        let row = batch_to_chunk(&batch, i, self.vector_dim)?;
        let distance = batch
          .column_by_name("_distance")
          .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
          .map(|arr| arr.value(i))
          .unwrap_or(0.0);
        hits.push((row, distance));
      }
    }

    Ok(hits)
  }
}

/// Escape single quotes in SQL strings.
pub fn escape_sql(s: &str) -> String {
  s.replace('\'', "''")
}

/// Convert chunk rows into a single Arrow RecordBatch.
fn chunks_to_batch(rows: &[ChunkRow], vector_dim: usize) -> Result<RecordBatch> {
  let n = rows.len();

  let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
  let paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
  let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
  let offsets: Vec<u64> = rows.iter().map(|r| r.offset).collect();
  let pages: Vec<Option<i32>> = rows.iter().map(|r| r.page).collect();
  let chunk_types: Vec<&str> = rows.iter().map(|r| r.chunk_type.as_str()).collect();
  let titles: Vec<Option<&str>> = rows.iter().map(|r| r.title.as_deref()).collect();
  let mtimes: Vec<i64> = rows.iter().map(|r| r.mtime).collect();

  let mut all_vectors: Vec<f32> = Vec::with_capacity(n * vector_dim);
  for row in rows {
    all_vectors.extend(&row.vector);
  }
  let vector_values = Float32Array::from(all_vectors);
  let field = Arc::new(Field::new("item", DataType::Float32, true));
  let vector_list = FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(vector_values), None)?;

  let batch = RecordBatch::try_new(
    chunks_schema(vector_dim),
    vec![
      Arc::new(StringArray::from(ids)),
      Arc::new(StringArray::from(paths)),
      Arc::new(StringArray::from(texts)),
      Arc::new(UInt64Array::from(offsets)),
      Arc::new(Int32Array::from(pages)),
      Arc::new(StringArray::from(chunk_types)),
      Arc::new(StringArray::from(titles)),
      Arc::new(Int64Array::from(mtimes)),
      Arc::new(vector_list),
    ],
  )?;

  Ok(batch)
}

/// Convert one RecordBatch row back into a ChunkRow.
fn batch_to_chunk(batch: &RecordBatch, row: usize, vector_dim: usize) -> Result<ChunkRow> {
  let string_col = |name: &'static str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or(StoreError::MissingColumn(name))
  };

  let id = string_col("id")?;
  let path = string_col("path")?;
  let text = string_col("text")?;
  let chunk_type = string_col("chunk_type")?;

  let offset = batch
    .column_by_name("offset")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row))
    .ok_or(StoreError::MissingColumn("offset"))?;

  let page = batch
    .column_by_name("page")
    .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
    .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row)) });

  let title = batch
    .column_by_name("title")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .and_then(|a| {
      if a.is_null(row) {
        None
      } else {
        Some(a.value(row).to_string())
      }
    });

  let mtime = batch
    .column_by_name("mtime")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or(StoreError::MissingColumn("mtime"))?;

  let vector = batch
    .column_by_name("vector")
    .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
    .and_then(|a| {
      let values = a.value(row);
      values
        .as_any()
        .downcast_ref::<Float32Array>()
        .map(|f| f.values().to_vec())
    })
    .unwrap_or_else(|| vec![0.0; vector_dim]);

  Ok(ChunkRow {
    id,
    path,
    text,
    offset,
    page,
    chunk_type,
    title,
    mtime,
    vector,
  })
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;

  const DIM: usize = 8;

  fn row(path: &str, offset: u64, seed: f32) -> ChunkRow {
    ChunkRow {
      id: ChunkRow::derive_id(path, offset),
      path: path.to_string(),
      text: format!("chunk at {offset}"),
      offset,
      page: (offset > 0).then_some((offset / 100) as i32),
      chunk_type: "text".to_string(),
      title: Some("doc".to_string()),
      mtime: 1_700_000_000_000,
      vector: (0..DIM).map(|i| seed + i as f32).collect(),
    }
  }

  async fn open_store() -> (TempDir, VectorStore) {
    let dir = TempDir::new().unwrap();
    let store = VectorStore::open(dir.path(), DIM).await.unwrap();
    (dir, store)
  }

  #[tokio::test]
  async fn test_tables_created_on_open() {
    let (dir, store) = open_store().await;
    let tables = store.connection.table_names().execute().await.unwrap();
    assert!(tables.contains(&"chunks".to_string()));
    assert!(tables.contains(&"file_status".to_string()));
    assert!(dir.path().join("chunks.lance").exists());
    assert!(dir.path().join("file_status.lance").exists());
  }

  #[tokio::test]
  async fn test_add_and_fetch_round_trip() {
    let (_dir, store) = open_store().await;
    let rows = vec![row("/docs/a.txt", 0, 0.5), row("/docs/a.txt", 800, 1.5)];
    store.add_chunks(&rows).await.unwrap();

    let fetched = store.chunks_for_path("/docs/a.txt").await.unwrap();
    assert_eq!(fetched, rows);
  }

  #[tokio::test]
  async fn test_delete_only_touches_one_path() {
    let (_dir, store) = open_store().await;
    store
      .add_chunks(&[row("/docs/a.txt", 0, 0.0), row("/docs/b.txt", 0, 9.0)])
      .await
      .unwrap();

    store.delete_chunks_for_path("/docs/a.txt").await.unwrap();

    assert!(store.chunks_for_path("/docs/a.txt").await.unwrap().is_empty());
    assert_eq!(store.chunks_for_path("/docs/b.txt").await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_vector_search_orders_by_distance() {
    let (_dir, store) = open_store().await;
    let near = ChunkRow {
      vector: vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      ..row("/docs/near.txt", 0, 0.0)
    };
    let far = ChunkRow {
      vector: vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
      ..row("/docs/far.txt", 0, 0.0)
    };
    store.add_chunks(&[far, near]).await.unwrap();

    let query = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    let hits = store.vector_search(&query, 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0.path, "/docs/near.txt");
    assert!(hits[0].1 < hits[1].1, "nearest hit must come first");
  }

  #[tokio::test]
  async fn test_dimension_mismatch_rejected() {
    let (_dir, store) = open_store().await;
    let mut bad = row("/docs/a.txt", 0, 0.0);
    bad.vector = vec![1.0; DIM + 1];
    let err = store.add_chunks(&[bad]).await.unwrap_err();
    assert!(matches!(err, StoreError::DimensionMismatch { .. }));
  }

  #[tokio::test]
  async fn test_sql_escaping_in_path_predicates() {
    let (_dir, store) = open_store().await;
    let tricky = "/docs/o'brien.txt";
    store.add_chunks(&[row(tricky, 0, 0.0)]).await.unwrap();
    assert_eq!(store.chunks_for_path(tricky).await.unwrap().len(), 1);
    store.delete_chunks_for_path(tricky).await.unwrap();
    assert!(store.chunks_for_path(tricky).await.unwrap().is_empty());
  }
}

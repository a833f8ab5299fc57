//! File-status catalogue.
//!
//! Persisted table keyed by absolute path, mirrored by an in-memory
//! cache. All reads hit the cache; writes go through to disk before the
//! cache is updated, so a crash can lose at most the in-flight write.
//! The catalogue is only ever touched from the worker process.

use std::{
  collections::HashMap,
  sync::Arc,
};

use arrow_array::{Array, Int32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt64Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use semdex_core::{FileRecord, FileStatus};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::store::{Result, StoreError, VectorStore, escape_sql, file_status_schema};

/// Catalogue of per-file indexing state.
pub struct Catalog {
  store: Arc<VectorStore>,
  cache: RwLock<HashMap<String, FileRecord>>,
}

impl Catalog {
  /// Open the catalogue and prime the cache from disk.
  pub async fn load(store: Arc<VectorStore>) -> Result<Self> {
    let catalog = Self {
      store,
      cache: RwLock::new(HashMap::new()),
    };
    catalog.reload().await?;
    Ok(catalog)
  }

  /// Re-read the whole table into the cache.
  pub async fn reload(&self) -> Result<()> {
    let table = self.store.file_status_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut cache = HashMap::new();
    for batch in &results {
      for i in 0..batch.num_rows() {
        let record = batch_to_record(batch, i)?;
        cache.insert(record.path.clone(), record);
      }
    }

    debug!(records = cache.len(), "Catalogue loaded");
    *self.cache.write().await = cache;
    Ok(())
  }

  pub async fn get(&self, path: &str) -> Option<FileRecord> {
    self.cache.read().await.get(path).cloned()
  }

  /// Snapshot of the full cache.
  pub async fn scan(&self) -> HashMap<String, FileRecord> {
    self.cache.read().await.clone()
  }

  pub async fn count_indexed(&self) -> u64 {
    self
      .cache
      .read()
      .await
      .values()
      .filter(|r| r.status == FileStatus::Indexed)
      .count() as u64
  }

  pub async fn count_failed(&self) -> u64 {
    self
      .cache
      .read()
      .await
      .values()
      .filter(|r| r.status == FileStatus::Failed)
      .count() as u64
  }

  /// Insert or replace a record. Disk first, then cache.
  pub async fn upsert(&self, record: FileRecord) -> Result<()> {
    trace!(path = %record.path, status = record.status.as_str(), "Catalogue upsert");

    let table = self.store.file_status_table().await?;
    table
      .delete(&format!("path = '{}'", escape_sql(&record.path)))
      .await?;

    let batch = record_to_batch(&record)?;
    let iter = RecordBatchIterator::new(vec![Ok(batch)], file_status_schema());
    table.add(Box::new(iter)).execute().await?;

    self.cache.write().await.insert(record.path.clone(), record);
    Ok(())
  }

  /// Remove a record. Disk first, then cache.
  pub async fn delete(&self, path: &str) -> Result<()> {
    trace!(path = %path, "Catalogue delete");

    let table = self.store.file_status_table().await?;
    table.delete(&format!("path = '{}'", escape_sql(path))).await?;

    self.cache.write().await.remove(path);
    Ok(())
  }

  /// Record a parse/index failure for a path.
  pub async fn mark_failed(&self, path: &str, error: &str, now_ms: i64) -> Result<()> {
    let previous = self.get(path).await;
    let record = FileRecord {
      path: path.to_string(),
      status: FileStatus::Failed,
      file_hash: previous.as_ref().map(|r| r.file_hash.clone()).unwrap_or_default(),
      parser_version: crate::parse::PARSER_VERSION,
      chunk_count: 0,
      last_modified: previous.as_ref().map(|r| r.last_modified).unwrap_or(0),
      indexed_at: previous.as_ref().map(|r| r.indexed_at).unwrap_or(0),
      last_retry: Some(now_ms),
      error_message: Some(error.to_string()),
    };
    self.upsert(record).await
  }
}

fn record_to_batch(record: &FileRecord) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    file_status_schema(),
    vec![
      Arc::new(StringArray::from(vec![record.path.clone()])),
      Arc::new(StringArray::from(vec![record.status.as_str()])),
      Arc::new(StringArray::from(vec![record.file_hash.clone()])),
      Arc::new(Int32Array::from(vec![record.parser_version])),
      Arc::new(UInt64Array::from(vec![record.chunk_count as u64])),
      Arc::new(Int64Array::from(vec![record.last_modified])),
      Arc::new(Int64Array::from(vec![record.indexed_at])),
      Arc::new(Int64Array::from(vec![record.last_retry])),
      Arc::new(StringArray::from(vec![record.error_message.clone()])),
    ],
  )?;
  Ok(batch)
}

fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<FileRecord> {
  let string_col = |name: &'static str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or(StoreError::MissingColumn(name))
  };

  let path = string_col("path")?;
  let status = FileStatus::parse(&string_col("status")?).ok_or(StoreError::MissingColumn("status"))?;
  let file_hash = string_col("file_hash")?;

  let parser_version = batch
    .column_by_name("parser_version")
    .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
    .map(|a| a.value(row))
    .ok_or(StoreError::MissingColumn("parser_version"))?;

  let chunk_count = batch
    .column_by_name("chunk_count")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row) as u32)
    .ok_or(StoreError::MissingColumn("chunk_count"))?;

  let int64_col = |name: &'static str| -> Result<i64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
      .map(|a| a.value(row))
      .ok_or(StoreError::MissingColumn(name))
  };

  let last_modified = int64_col("last_modified")?;
  let indexed_at = int64_col("indexed_at")?;

  let last_retry = batch
    .column_by_name("last_retry")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row)) });

  let error_message = batch
    .column_by_name("error_message")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .and_then(|a| {
      if a.is_null(row) {
        None
      } else {
        Some(a.value(row).to_string())
      }
    });

  Ok(FileRecord {
    path,
    status,
    file_hash,
    parser_version,
    chunk_count,
    last_modified,
    indexed_at,
    last_retry,
    error_message,
  })
}

//! File processor.
//!
//! The file queue's handler: parse → chunk → embed → write → record.
//! A parse failure marks the catalogue entry failed and moves on; the
//! queue keeps running. Writes for a new run purge the file's previous
//! chunks before fresh ones are appended, so the store only ever shows
//! the most recent successful indexing of a path.

use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use semdex_core::{FileRecord, FileStatus};
use tracing::{debug, trace, warn};

use crate::{
  catalog::Catalog,
  chunker::{ChunkerConfig, chunk_text},
  parse::{self, PARSER_VERSION},
  queue::{
    embed::{ChunkInput, EmbedQueueHandle},
    write::{WriteOp, WriteQueueHandle},
  },
};

pub struct FileProcessor {
  catalog: Arc<Catalog>,
  embed_queue: EmbedQueueHandle,
  write_queue: WriteQueueHandle,
  chunker: ChunkerConfig,
  /// Monotonic index of files entering the pipeline this run.
  file_counter: AtomicUsize,
}

impl FileProcessor {
  pub fn new(
    catalog: Arc<Catalog>,
    embed_queue: EmbedQueueHandle,
    write_queue: WriteQueueHandle,
    chunker: ChunkerConfig,
  ) -> Self {
    Self {
      catalog,
      embed_queue,
      write_queue,
      chunker,
      file_counter: AtomicUsize::new(0),
    }
  }

  /// Index one file end to end. Returns a displayable error for the
  /// file-queue failure counter.
  pub async fn process(&self, path: &Path) -> Result<(), String> {
    let path_str = path.to_string_lossy().into_owned();
    let now_ms = chrono::Utc::now().timestamp_millis();

    // Completed trackers from earlier files have shown their 100% long
    // enough once new work begins.
    self.embed_queue.cleanup_completed().await;

    let metadata = match tokio::fs::metadata(path).await {
      Ok(m) => m,
      Err(e) => {
        let message = format!("stat failed: {e}");
        self.record_failure(&path_str, &message, now_ms).await;
        return Err(message);
      }
    };
    let mtime_ms = metadata
      .modified()
      .ok()
      .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
      .map(|d| d.as_millis() as i64)
      .unwrap_or(0);
    let mtime_ns = metadata
      .modified()
      .ok()
      .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
      .map(|d| d.as_nanos() as i64)
      .unwrap_or(0);
    let file_hash = semdex_core::metadata_digest(metadata.len(), mtime_ns);

    let parsed = match parse::parse_document(path).await {
      Ok(parsed) => parsed,
      Err(e) => {
        let message = e.to_string();
        warn!(path = %path_str, error = %message, "Parse failed");
        self.record_failure(&path_str, &message, now_ms).await;
        return Err(message);
      }
    };

    let chunks = chunk_text(&parsed.text, self.chunker);
    debug!(path = %path_str, chunks = chunks.len(), "File chunked");

    // Honour backpressure before feeding more chunks downstream.
    while self.embed_queue.should_apply_backpressure() {
      trace!(path = %path_str, "Embedding queue backpressure, waiting");
      tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Purge the previous run's chunks first; the write queue serialises
    // this ahead of the appends that follow.
    self
      .write_queue
      .enqueue(WriteOp::Purge { path: path_str.clone() })
      .await
      .map_err(|e| e.to_string())?;

    let chunk_count = chunks.len() as u32;
    if chunk_count > 0 {
      let title = path.file_stem().map(|s| s.to_string_lossy().into_owned());
      let file_index = self.file_counter.fetch_add(1, Ordering::Relaxed);
      let inputs: Vec<ChunkInput> = chunks
        .into_iter()
        .map(|c| ChunkInput {
          page: parsed.page_at(c.offset),
          text: c.text,
          offset: c.offset,
          title: title.clone(),
          mtime: mtime_ms,
        })
        .collect();

      self.embed_queue.add_chunks(path_str.clone(), file_index, inputs).await;

      if let Err(e) = self.embed_queue.wait_for_completion(path_str.clone()).await {
        self.record_failure(&path_str, &e, now_ms).await;
        return Err(e);
      }
    }

    let record = FileRecord {
      path: path_str.clone(),
      status: FileStatus::Indexed,
      file_hash,
      parser_version: PARSER_VERSION,
      chunk_count,
      last_modified: mtime_ms,
      indexed_at: chrono::Utc::now().timestamp_millis(),
      last_retry: None,
      error_message: None,
    };
    self
      .catalog
      .upsert(record)
      .await
      .map_err(|e| format!("catalogue update failed: {e}"))?;

    debug!(path = %path_str, chunks = chunk_count, "File indexed");
    Ok(())
  }

  /// Remove a file from the store and the catalogue.
  pub async fn remove(&self, path: &Path) -> Result<(), String> {
    let path_str = path.to_string_lossy().into_owned();
    debug!(path = %path_str, "Removing file from index");

    self
      .write_queue
      .enqueue(WriteOp::Purge { path: path_str.clone() })
      .await
      .map_err(|e| e.to_string())?;
    self.catalog.delete(&path_str).await.map_err(|e| e.to_string())?;
    self.embed_queue.cleanup_file_tracker(path_str).await;
    Ok(())
  }

  async fn record_failure(&self, path: &str, message: &str, now_ms: i64) {
    if let Err(e) = self.catalog.mark_failed(path, message, now_ms).await {
      warn!(path = %path, error = %e, "Failed to record failure in catalogue");
    }
  }
}

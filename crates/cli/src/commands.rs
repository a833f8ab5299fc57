//! One-shot CLI commands against the worker.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use ipc::{ReindexParams, RequestData, ResponseData, ScanOptions, SearchParams, WatchStartParams};
use semdex_core::ConfigStore;

use crate::client::{self, Client};

pub async fn cmd_search(query: String, limit: usize) -> Result<()> {
  let mut client = client::connect_or_start().await?;
  ensure_initialised(&mut client).await?;

  let result = client
    .request(RequestData::Search(SearchParams { q: query, k: limit }))
    .await?;

  let ResponseData::Search(hits) = result else {
    bail!("unexpected response to search");
  };

  if hits.is_empty() {
    println!("No results.");
    return Ok(());
  }

  for (i, hit) in hits.iter().enumerate() {
    let location = match hit.page {
      Some(page) => format!("{} (page {page})", hit.path),
      None => hit.path.clone(),
    };
    println!("{:2}. [{:.3}] {location}", i + 1, hit.score);
    let preview: String = hit.text.chars().take(160).collect();
    println!("      {}", preview.replace('\n', " "));
  }
  Ok(())
}

pub async fn cmd_status() -> Result<()> {
  let mut client = client::connect_or_start().await?;
  ensure_initialised(&mut client).await?;

  let result = client.request(RequestData::Stats).await?;
  let ResponseData::Stats(stats) = result else {
    bail!("unexpected response to stats");
  };

  println!("Indexed files: {}", stats.indexed_files);
  println!("Total chunks:  {}", stats.total_chunks);
  if !stats.folder_stats.is_empty() {
    println!("\nFolders:");
    for folder in &stats.folder_stats {
      println!(
        "  {}  {}/{} files indexed",
        folder.folder, folder.indexed_files, folder.total_files
      );
    }
  }
  Ok(())
}

pub async fn cmd_progress() -> Result<()> {
  let mut client = client::connect_or_start().await?;
  ensure_initialised(&mut client).await?;

  let result = client.request(RequestData::Progress).await?;
  let ResponseData::Progress(progress) = result else {
    bail!("unexpected response to progress");
  };

  println!(
    "queued: {}  processing: {}  errors: {}",
    progress.queued, progress.processing, progress.errors
  );
  for file in &progress.files {
    let percent = if file.total_chunks == 0 {
      100
    } else {
      file.processed_chunks * 100 / file.total_chunks
    };
    println!("  {percent:3}% {}", file.path);
  }
  Ok(())
}

pub async fn cmd_folders_add(path: PathBuf) -> Result<()> {
  let absolute = if path.is_absolute() {
    path
  } else {
    std::env::current_dir()?.join(path)
  };
  if !absolute.is_dir() {
    bail!("not a directory: {}", absolute.display());
  }

  let store = ConfigStore::new(&client::default_db_dir());
  let config = store.add_folder(&absolute).await?;
  println!("Watching {}", absolute.display());

  refresh_worker(&config).await;
  Ok(())
}

pub async fn cmd_folders_remove(path: PathBuf) -> Result<()> {
  let absolute = if path.is_absolute() {
    path
  } else {
    std::env::current_dir()?.join(path)
  };

  let store = ConfigStore::new(&client::default_db_dir());
  let config = store.remove_folder(&absolute).await?;
  println!("Stopped watching {}", absolute.display());

  refresh_worker(&config).await;
  Ok(())
}

pub async fn cmd_folders_list() -> Result<()> {
  let store = ConfigStore::new(&client::default_db_dir());
  let config = store.load().await?;

  if config.watched_folders.is_empty() {
    println!("No folders are being watched.");
    return Ok(());
  }
  for folder in &config.watched_folders {
    let marker = if folder.active { "*" } else { " " };
    println!("{marker} {}", folder.path.display());
  }
  Ok(())
}

pub async fn cmd_reindex(force: bool) -> Result<()> {
  let mut client = client::connect_or_start().await?;
  ensure_initialised(&mut client).await?;
  client
    .request(RequestData::ReindexAll(ReindexParams { force }))
    .await?;
  println!("Reindex started{}", if force { " (forced)" } else { "" });
  Ok(())
}

pub async fn cmd_stop() -> Result<()> {
  if !client::is_worker_running() {
    println!("Worker is not running.");
    return Ok(());
  }

  let mut client = Client::connect().await?;
  let result = client.request(RequestData::Shutdown).await?;
  let ResponseData::Shutdown(result) = result else {
    bail!("unexpected response to shutdown");
  };

  for step in &result.steps {
    let status = if step.success {
      "ok"
    } else if step.timed_out {
      "timed out"
    } else {
      "failed"
    };
    println!("  {:24} {status}", step.step);
  }
  println!("{}", if result.success { "Worker stopped." } else { "Worker stopped with errors." });
  Ok(())
}

/// Make sure the worker has an engine; a freshly auto-started worker
/// needs `init` before it can answer anything else.
async fn ensure_initialised(client: &mut Client) -> Result<()> {
  let probe = client.request(RequestData::Progress).await;
  if probe.is_ok() {
    return Ok(());
  }

  client
    .request_streaming(
      RequestData::Init(ipc::InitParams {
        db_dir: client::default_db_dir(),
      }),
      |_push| {},
    )
    .await?;
  Ok(())
}

/// Push the new config to a running worker: restart the watcher with
/// fresh options and plan a pass so additions and removals apply.
async fn refresh_worker(config: &semdex_core::Config) {
  if !client::is_worker_running() {
    return;
  }
  let Ok(mut client) = Client::connect().await else {
    return;
  };

  let roots = config.active_roots();
  let options: ScanOptions = semdex::scan::scan_options_from_config(config);
  if roots.is_empty() {
    let _ = client.request(RequestData::WatchStop).await;
  } else {
    let _ = client
      .request(RequestData::WatchStart(WatchStartParams { roots, options }))
      .await;
  }
  let _ = client
    .request(RequestData::ReindexAll(ReindexParams { force: false }))
    .await;
}

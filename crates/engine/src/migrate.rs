//! Database version ladder.
//!
//! A single ASCII integer in `.db-version` records the schema generation
//! of the on-disk store. A value lower than the compiled `DB_VERSION`
//! (or an unreadable/absent file next to existing tables) wipes every
//! `*.lance` table so the store is rebuilt from scratch; the new version
//! is written only after successful reinitialisation.

use std::path::Path;

use tracing::{info, warn};

/// Compiled schema generation.
pub const DB_VERSION: u32 = 6;

const VERSION_FILE: &str = ".db-version";

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Read the persisted version, `None` when absent or unparseable.
pub async fn read_database_version(db_dir: &Path) -> Option<u32> {
  let raw = tokio::fs::read_to_string(db_dir.join(VERSION_FILE)).await.ok()?;
  raw.trim().parse().ok()
}

/// Returns true when the on-disk store must be wiped and rebuilt.
///
/// A brand-new directory (no tables yet) needs no wipe; an existing
/// store with a missing or older version does.
pub async fn check_database_version(db_dir: &Path) -> bool {
  match read_database_version(db_dir).await {
    Some(version) if version >= DB_VERSION => false,
    Some(version) => {
      info!(found = version, compiled = DB_VERSION, "Database version behind, wipe required");
      true
    }
    None => has_tables(db_dir).await,
  }
}

/// Delete every `*.lance` table directory and the version file.
pub async fn wipe_database(db_dir: &Path) -> Result<(), MigrateError> {
  let mut entries = match tokio::fs::read_dir(db_dir).await {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e.into()),
  };

  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    let is_table = path.is_dir()
      && path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "lance");
    if is_table {
      info!(table = %path.display(), "Dropping table for migration");
      if let Err(e) = tokio::fs::remove_dir_all(&path).await {
        warn!(table = %path.display(), error = %e, "Failed to drop table");
        return Err(e.into());
      }
    }
  }

  match tokio::fs::remove_file(db_dir.join(VERSION_FILE)).await {
    Ok(()) => {}
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => return Err(e.into()),
  }

  Ok(())
}

/// Record the compiled version after a successful (re)initialisation.
pub async fn write_database_version(db_dir: &Path) -> Result<(), MigrateError> {
  tokio::fs::create_dir_all(db_dir).await?;
  tokio::fs::write(db_dir.join(VERSION_FILE), DB_VERSION.to_string()).await?;
  Ok(())
}

async fn has_tables(db_dir: &Path) -> bool {
  let Ok(mut entries) = tokio::fs::read_dir(db_dir).await else {
    return false;
  };
  while let Ok(Some(entry)) = entries.next_entry().await {
    let path = entry.path();
    if path.is_dir()
      && path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "lance")
    {
      return true;
    }
  }
  false
}

pub mod config;
pub mod dirs;
pub mod types;

pub use config::{Config, ConfigError, ConfigStore, CpuThrottle, FileTypeToggles, Settings, WatchedFolder};
pub use types::{DocumentKind, FileRecord, FileStatus, chunk_id, metadata_digest};

//! Single-ownership queues with message-passing facades.
//!
//! Each queue owns its storage inside a task; producers push through a
//! handle and the owning task drains. Stats are messages returning a
//! snapshot, never shared mutable state.

pub mod embed;
pub mod files;
pub mod write;

pub use embed::{EmbedQueue, EmbedQueueConfig, EmbedQueueHandle, EmbedderBackend, PendingChunk};
pub use files::{FileQueue, FileQueueConfig, FileQueueHandle, FileQueueStats};
pub use write::{ChunkCommitter, StoreCommitter, WriteError, WriteOp, WriteQueue, WriteQueueConfig, WriteQueueHandle, WriteQueueState};

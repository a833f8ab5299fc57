use serde::{Deserialize, Serialize};

/// Operations the worker accepts over the supervisor socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
  Init,
  WatchStart,
  WatchStop,
  Enqueue,
  Stats,
  Search,
  Progress,
  ReindexAll,
  Shutdown,
}

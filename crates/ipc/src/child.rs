//! Wire frames between the worker and an embedder child process.
//!
//! One JSON object per line on the child's stdin/stdout. Requests carry a
//! numeric correlation id; the child answers strictly in arrival order,
//! one request at a time.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum ChildRequest {
  Init {
    id: u64,
    model_dir: PathBuf,
    dim: usize,
  },
  Embed {
    id: u64,
    texts: Vec<String>,
    is_query: bool,
  },
  Shutdown,
}

impl ChildRequest {
  pub fn id(&self) -> Option<u64> {
    match self {
      ChildRequest::Init { id, .. } | ChildRequest::Embed { id, .. } => Some(*id),
      ChildRequest::Shutdown => None,
    }
  }
}

/// Child reply; exactly one of `ready` / `vectors` / `error` is set.
/// `rss_bytes` rides along so the pool can enforce its memory policy
/// without a separate probe round-trip.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResponse {
  pub id: u64,
  pub ready: Option<bool>,
  pub vectors: Option<Vec<Vec<f32>>>,
  pub error: Option<String>,
  pub rss_bytes: Option<u64>,
}

impl ChildResponse {
  pub fn ready(id: u64, rss_bytes: u64) -> Self {
    Self {
      id,
      ready: Some(true),
      vectors: None,
      error: None,
      rss_bytes: Some(rss_bytes),
    }
  }

  pub fn vectors(id: u64, vectors: Vec<Vec<f32>>, rss_bytes: u64) -> Self {
    Self {
      id,
      ready: None,
      vectors: Some(vectors),
      error: None,
      rss_bytes: Some(rss_bytes),
    }
  }

  pub fn error(id: u64, error: impl Into<String>) -> Self {
    Self {
      id,
      ready: None,
      vectors: None,
      error: Some(error.into()),
      rss_bytes: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_embed_request_round_trip() {
    let request = ChildRequest::Embed {
      id: 7,
      texts: vec!["passage one".to_string()],
      is_query: false,
    };
    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"op\":\"embed\""));
    let back: ChildRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, request);
    assert_eq!(back.id(), Some(7));
  }

  #[test]
  fn test_shutdown_has_no_id() {
    let request = ChildRequest::Shutdown;
    assert_eq!(request.id(), None);
    let json = serde_json::to_string(&request).unwrap();
    assert_eq!(json, r#"{"op":"shutdown"}"#);
  }

  #[test]
  fn test_error_response_skips_empty_fields() {
    let response = ChildResponse::error(3, "tokenizer failed");
    let json = serde_json::to_string(&response).unwrap();
    assert!(!json.contains("vectors"));
    assert!(!json.contains("ready"));
    assert!(json.contains("tokenizer failed"));
  }
}

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
  error::IpcError,
  request::RequestData,
  response::ResponseData,
  stage::{StartupErrorCode, StartupStage},
};

/// Request envelope. `id` is a client-generated correlation id echoed in
/// the matching response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub id: String,
  #[serde(flatten)]
  pub data: RequestData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
  pub code: i32,
  pub message: String,
}

/// Response envelope; exactly one of `result` / `error` is set.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub id: String,
  pub result: Option<ResponseData>,
  pub error: Option<RpcError>,
}

impl Response {
  pub fn success(id: impl Into<String>, result: ResponseData) -> Self {
    Self {
      id: id.into(),
      result: Some(result),
      error: None,
    }
  }

  pub fn rpc_error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      result: None,
      error: Some(RpcError {
        code,
        message: message.into(),
      }),
    }
  }

  pub fn into_result(self) -> Result<ResponseData, IpcError> {
    if let Some(error) = self.error {
      return Err(IpcError::Rpc {
        code: error.code,
        message: error.message,
      });
    }
    self.result.ok_or(IpcError::NoResult)
  }
}

/// Unsolicited frames pushed by the worker, tagged by channel.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel")]
pub enum PushFrame {
  #[serde(rename = "startup:stage")]
  Stage {
    stage: StartupStage,
    message: Option<String>,
    progress: Option<f32>,
  },
  #[serde(rename = "startup:error")]
  StartupError {
    code: StartupErrorCode,
    message: String,
    details: Option<serde_json::Value>,
  },
  #[serde(rename = "model:download:progress")]
  DownloadProgress {
    file: String,
    progress: f32,
    loaded: u64,
    total: u64,
  },
}

/// Anything the worker writes to the socket: a correlated response or a
/// push frame. Push frames carry a `channel` tag, responses never do, so
/// untagged deserialisation is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
  Push(PushFrame),
  Response(Response),
}

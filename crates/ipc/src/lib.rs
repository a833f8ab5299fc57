mod child;
mod error;
mod method;
mod protocol;
mod request;
mod response;
mod stage;

pub use child::{ChildRequest, ChildResponse};
pub use error::IpcError;
pub use method::Method;
pub use protocol::{PushFrame, Request, Response, RpcError, ServerFrame};
pub use request::{InitParams, ReindexParams, RequestData, ScanOptions, SearchParams, WatchStartParams};
pub use response::{
  FileProgress, FolderStats, ProgressResult, ResponseData, SearchHit, ShutdownResult, StatsResult, StepReport,
};
pub use stage::{STARTUP_STAGES, StageTracker, StartupErrorCode, StartupStage};

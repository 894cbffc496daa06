use thiserror::Error;
use warpgrid_alloc::RpcError;

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by the node-local client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown allocation {0:?}")]
    UnknownAllocation(String),

    #[error("unknown task name {0:?}")]
    UnknownTask(String),

    #[error("invalid signal {0:?}")]
    InvalidSignal(String),

    #[error("task {0:?} is not running")]
    TaskNotRunning(String),

    #[error("allocation {0:?} has no running tasks")]
    NoRunningTasks(String),

    #[error("allocation directory of {0:?} is in use")]
    AllocDirInUse(String),

    #[error("allocation directory error: {0}")]
    AllocDir(#[from] std::io::Error),
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::UnknownAllocation(alloc_id) => RpcError::UnknownAllocation { alloc_id },
            ClientError::AllocDir(e) => RpcError::Remote(e.to_string()),
            in_use @ ClientError::AllocDirInUse(_) => RpcError::Remote(in_use.to_string()),
            other => RpcError::BadRequest(other.to_string()),
        }
    }
}

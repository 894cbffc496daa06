//! Backend RPC errors and their normalization into API errors.
//!
//! Transports report failures as [`RpcError`], a structured enum that
//! survives the peer RPC wire intact. Verbs turn them into [`ApiError`]
//! exactly once via [`classify`], which inspects the variant rather than
//! the message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for allocation verbs.
pub type ApiResult<T> = Result<T, ApiError>;

/// Message returned when no execution context can serve a request.
pub const NO_ROUTE: &str = "no local node and no node/allocation route available";

/// Message returned when an allocation lookup comes back empty.
pub const ALLOC_NOT_FOUND: &str = "alloc not found";

/// Message returned when an allocation directory cannot be opened.
pub const ALLOCATION_NOT_FOUND: &str = "allocation not found";

/// Message returned for unrecognized sub-resources.
pub const RESOURCE_NOT_FOUND: &str = "resource not found";

/// Message returned for unsupported HTTP methods.
pub const INVALID_METHOD: &str = "Invalid method";

/// Message returned when a client-only operation reaches an agent without one.
pub const CLIENT_NOT_RUNNING: &str = "node is not running a WarpGrid client";

/// Failure reported by a transport or by the remote handler behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RpcError {
    /// The target node has no live connection to the caller.
    #[error("no path to node {node_id:?}")]
    NoNodeConnection { node_id: String },

    /// The target node does not know the allocation.
    #[error("unknown allocation {alloc_id:?}")]
    UnknownAllocation { alloc_id: String },

    #[error("permission denied")]
    PermissionDenied,

    #[error("{0}")]
    BadRequest(String),

    /// The caller's deadline elapsed before a reply arrived.
    #[error("rpc {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("unknown rpc method {0:?}")]
    UnknownMethod(String),

    #[error("rpc transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Remote(String),
}

/// Stable failure categories used to pick an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NoConnection,
    UnknownAllocation,
    BadRequest,
    PermissionDenied,
    Internal,
}

impl ErrorKind {
    /// Default HTTP status for this kind.
    pub const fn status(self) -> u16 {
        match self {
            Self::NotFound | Self::NoConnection | Self::UnknownAllocation => 404,
            Self::BadRequest => 400,
            Self::PermissionDenied => 403,
            Self::Internal => 500,
        }
    }
}

/// A classified error with a stable status code and the original message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub code: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.status(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// A bad request answered with 405.
    pub fn method_not_allowed() -> Self {
        Self {
            code: 405,
            ..Self::bad_request(INVALID_METHOD)
        }
    }

    pub fn permission_denied() -> Self {
        Self::new(ErrorKind::PermissionDenied, "Permission denied")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether the boundary renders this error as 404.
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }
}

/// Normalize a backend error into an [`ApiError`].
///
/// Total and pure: every variant maps to exactly one kind.
pub fn classify(err: &RpcError) -> ApiError {
    let kind = match err {
        RpcError::NoNodeConnection { .. } | RpcError::Timeout { .. } => ErrorKind::NoConnection,
        RpcError::UnknownAllocation { .. } => ErrorKind::UnknownAllocation,
        RpcError::PermissionDenied => ErrorKind::PermissionDenied,
        RpcError::BadRequest(_) => ErrorKind::BadRequest,
        RpcError::UnknownMethod(_) | RpcError::Transport(_) | RpcError::Remote(_) => {
            ErrorKind::Internal
        }
    };
    ApiError::new(kind, err.to_string())
}

/// Anything that can be reduced to an [`ApiError`].
///
/// Classifying an `ApiError` returns it unchanged.
pub trait Classify {
    fn classify(&self) -> ApiError;
}

impl Classify for RpcError {
    fn classify(&self) -> ApiError {
        classify(self)
    }
}

impl Classify for ApiError {
    fn classify(&self) -> ApiError {
        self.clone()
    }
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        classify(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_connection_is_not_found() {
        let err = RpcError::NoNodeConnection {
            node_id: "node1".to_string(),
        };
        let classified = classify(&err);
        assert_eq!(classified.kind, ErrorKind::NoConnection);
        assert_eq!(classified.code, 404);
        assert!(classified.message.contains("node1"));
    }

    #[test]
    fn unknown_allocation_is_not_found() {
        let err = RpcError::UnknownAllocation {
            alloc_id: "abc".to_string(),
        };
        let classified = classify(&err);
        assert_eq!(classified.kind, ErrorKind::UnknownAllocation);
        assert!(classified.is_not_found());
    }

    #[test]
    fn timeout_is_treated_as_no_connection() {
        let err = RpcError::Timeout {
            method: "Allocations.Stats".to_string(),
            timeout_ms: 10,
        };
        assert_eq!(classify(&err).kind, ErrorKind::NoConnection);
    }

    #[test]
    fn unrecognized_errors_are_internal() {
        for err in [
            RpcError::Remote("disk on fire".to_string()),
            RpcError::Transport("reset".to_string()),
            RpcError::UnknownMethod("Foo.Bar".to_string()),
        ] {
            let classified = classify(&err);
            assert_eq!(classified.kind, ErrorKind::Internal);
            assert_eq!(classified.code, 500);
        }
    }

    #[test]
    fn message_text_does_not_drive_classification() {
        let err = RpcError::Remote("no path to node \"node1\"".to_string());
        assert_eq!(classify(&err).kind, ErrorKind::Internal);
    }

    #[test]
    fn classification_is_idempotent() {
        let errs = [
            RpcError::NoNodeConnection {
                node_id: "n".to_string(),
            },
            RpcError::PermissionDenied,
            RpcError::BadRequest("bad".to_string()),
            RpcError::Remote("boom".to_string()),
        ];
        for err in errs {
            let once = err.classify();
            let twice = once.classify();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn method_not_allowed_keeps_bad_request_kind() {
        let err = ApiError::method_not_allowed();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert_eq!(err.code, 405);
        assert_eq!(err.message, INVALID_METHOD);
    }

    #[test]
    fn rpc_error_survives_json_round_trip() {
        let err = RpcError::UnknownAllocation {
            alloc_id: "abc".to_string(),
        };
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["kind"], "unknown_allocation");
        let back: RpcError = serde_json::from_value(wire).unwrap();
        assert_eq!(back, err);
    }
}

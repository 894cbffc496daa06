//! warpgrid-alloc — allocation operation dispatch for WarpGrid agents.
//!
//! Decides where an allocation operation runs and issues it through a
//! uniform transport abstraction:
//!
//! ```text
//! AllocEndpoint (verbs)
//!   ├── ContextResolver ── Topology (locality oracle)
//!   │     Local → ClientChannel → ServerChannel → Unavailable
//!   ├── Dispatcher ── Transports { local, client, server }
//!   │     Operation → MethodSet { local, channel, server }
//!   └── classify() ── RpcError → ApiError { kind, code, message }
//! ```
//!
//! The resolver never performs I/O and picks exactly one context per
//! request. The dispatcher never retries across contexts. Transport
//! failures are classified once, by the verb that issued the call.

pub mod codec;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod snapshot;
pub mod structs;

pub use codec::{CodecError, DeflateCodec, PayloadCodec, decode_job_payload};
pub use context::{ContextResolver, ExecutionContext, StaticTopology, Target, Topology};
pub use dispatch::{
    DEFAULT_RPC_TIMEOUT, Dispatcher, MethodSet, Operation, Transport, Transports, handle_json,
};
pub use endpoint::AllocEndpoint;
pub use error::{ApiError, ApiResult, Classify, ErrorKind, RpcError, classify};
pub use snapshot::{
    AllocFs, SinkWriter, SnapshotError, SnapshotSink, SnapshotSource, SnapshotStream,
};
pub use structs::*;

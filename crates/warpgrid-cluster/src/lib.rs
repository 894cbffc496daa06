//! warpgrid-cluster — server and node roles of a multi-node WarpGrid.
//!
//! Agents talk to each other over peer RPC: JSON envelopes posted to
//! `/v1/internal/rpc/{method}`. Servers answer allocation reads and
//! writes from the state store and broker client-routed calls to the
//! node that owns the allocation.
//!
//! # Architecture
//!
//! ```text
//! Server
//!   ├── ServerBroker (Transport)
//!   │   ├── Alloc.List / Alloc.GetAlloc / Alloc.Stop → StateStore
//!   │   ├── Node.Register / Heartbeat / GetClientAllocs / UpdateAlloc
//!   │   └── ClientAllocations.* → HttpRpcTransport to the owning node
//!   └── MembershipManager
//!       ├── Tracks node status (Ready, Dead)
//!       └── Persists to StateStore
//!
//! Client node
//!   └── NodeAgent
//!       ├── Registers and heartbeats through a ServerPool
//!       └── Syncs allocations into the LocalClient
//! ```

pub mod agent;
pub mod broker;
pub mod membership;
pub mod rpc;
pub mod structs;

pub use agent::NodeAgent;
pub use broker::{HttpNodeConnector, NodeConnector, ServerBroker};
pub use membership::{Member, MemberStatus, MembershipManager};
pub use rpc::{HttpRpcTransport, RPC_PATH_PREFIX, RpcMux, ServerPool, call_json};

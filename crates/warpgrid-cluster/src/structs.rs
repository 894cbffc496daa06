//! Envelopes of the `Node.*` peer RPC methods.

use serde::{Deserialize, Serialize};
use warpgrid_state::{Allocation, NodeInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegisterRequest {
    pub node: NodeInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeatRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeatResponse {
    /// Interval the servers expect between heartbeats.
    pub heartbeat_interval_ms: u64,
    /// False when the servers no longer know the node; it must re-register.
    pub known: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeClientAllocsResponse {
    pub allocs: Vec<Allocation>,
    pub index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdateAllocRequest {
    pub allocs: Vec<Allocation>,
}

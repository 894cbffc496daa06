//! Request and reply envelopes exchanged with every transport.
//!
//! All envelopes are plain serde types so the same value can be handed
//! to an in-process handler or sent over the peer RPC wire.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warpgrid_state::{AllocListStub, Allocation};

// ── Metadata ──────────────────────────────────────────────────────

/// Read options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub region: String,
    pub namespace: String,
    /// Only return results whose ID starts with this prefix.
    pub prefix: String,
    /// Allow any server to answer, not just the leader.
    pub allow_stale: bool,
    pub min_query_index: u64,
    pub max_query_time_ms: u64,
    /// Deadline for the whole call; 0 uses the dispatcher default.
    pub timeout_ms: u64,
    pub auth_token: String,
}

impl QueryOptions {
    /// The caller-supplied deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Write options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRequest {
    pub region: String,
    pub namespace: String,
    pub auth_token: String,
    pub idempotency_token: String,
    pub timeout_ms: u64,
}

impl WriteRequest {
    /// The caller-supplied deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Response metadata for reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMeta {
    /// Index of the latest write reflected in the result.
    pub index: u64,
    pub last_contact_ms: u64,
    pub known_leader: bool,
}

// ── Server-authoritative requests ─────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocListRequest {
    #[serde(default)]
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocListResponse {
    /// `None` when a backend reports no list at all.
    #[serde(default)]
    pub allocations: Option<Vec<AllocListStub>>,
    #[serde(default)]
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSpecificRequest {
    pub alloc_id: String,
    #[serde(default)]
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleAllocResponse {
    #[serde(default)]
    pub alloc: Option<Allocation>,
    #[serde(default)]
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStopRequest {
    pub alloc_id: String,
    #[serde(default)]
    pub write: WriteRequest,
}

/// Acknowledgement of a stop: the evaluation created and the write index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStopResponse {
    pub eval_id: String,
    pub index: u64,
}

// ── Client-routed requests ────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRestartRequest {
    pub alloc_id: String,
    /// Restart a single task; empty restarts every running task.
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub query: QueryOptions,
}

/// Body accepted by the restart endpoint. Deliberately carries no
/// allocation ID: the path names the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AllocRestartBody {
    #[serde(default, alias = "TaskName")]
    pub task_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSignalRequest {
    #[serde(default, alias = "AllocID")]
    pub alloc_id: String,
    /// Signal a single task; empty signals every running task.
    #[serde(default, alias = "Task")]
    pub task: String,
    /// Signal name such as `SIGHUP`; empty means the client default.
    #[serde(default, alias = "Signal")]
    pub signal: String,
    #[serde(default)]
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStatsRequest {
    pub alloc_id: String,
    /// Restrict the result to a single task; empty returns all tasks.
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub query: QueryOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocStatsResponse {
    #[serde(default)]
    pub stats: Option<AllocResourceUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpecificRequest {
    /// Empty targets the local node.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub query: QueryOptions,
}

/// Generic acknowledgement envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericResponse {
    #[serde(default)]
    pub index: u64,
}

// ── Resource usage ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub usage: u64,
    pub max_usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub system_mode: f64,
    pub user_mode: f64,
    pub total_ticks: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory: MemoryStats,
    pub cpu: CpuStats,
}

impl ResourceUsage {
    /// Accumulate another sample into this one.
    pub fn add(&mut self, other: &ResourceUsage) {
        self.memory.rss += other.memory.rss;
        self.memory.cache += other.memory.cache;
        self.memory.swap += other.memory.swap;
        self.memory.usage += other.memory.usage;
        self.memory.max_usage += other.memory.max_usage;
        self.cpu.system_mode += other.cpu.system_mode;
        self.cpu.user_mode += other.cpu.user_mode;
        self.cpu.total_ticks += other.cpu.total_ticks;
        self.cpu.percent += other.cpu.percent;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    pub resource_usage: ResourceUsage,
    /// Unix timestamp (nanoseconds) of the sample.
    pub timestamp: i64,
}

/// Resource usage of an allocation, aggregated and per task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocResourceUsage {
    pub resource_usage: ResourceUsage,
    pub tasks: HashMap<String, TaskResourceUsage>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_body_accepts_capitalized_fields() {
        let req: AllocSignalRequest =
            serde_json::from_str(r#"{"Signal":"SIGHUP","Task":"web"}"#).unwrap();
        assert_eq!(req.signal, "SIGHUP");
        assert_eq!(req.task, "web");
        assert!(req.alloc_id.is_empty());
    }

    #[test]
    fn restart_body_ignores_alloc_id() {
        let body: AllocRestartBody =
            serde_json::from_str(r#"{"alloc_id":"other","task_name":"web"}"#).unwrap();
        assert_eq!(body.task_name, "web");
    }

    #[test]
    fn list_response_tolerates_null_allocations() {
        let resp: AllocListResponse =
            serde_json::from_str(r#"{"allocations":null,"meta":{"index":3}}"#).unwrap();
        assert!(resp.allocations.is_none());
        assert_eq!(resp.meta.index, 3);
    }

    #[test]
    fn deadline_only_when_set() {
        let mut q = QueryOptions::default();
        assert!(q.deadline().is_none());
        q.timeout_ms = 250;
        assert_eq!(q.deadline(), Some(Duration::from_millis(250)));
    }
}

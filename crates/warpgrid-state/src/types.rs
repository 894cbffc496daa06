//! Domain types for the WarpGrid allocation store.
//!
//! These types represent the persisted state of allocations, the jobs
//! they were placed from, and the cluster nodes that run them. All types
//! are serializable to/from JSON for storage in redb tables and for the
//! peer RPC wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for an allocation.
pub type AllocId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a job.
pub type JobId = String;

// ── Job ───────────────────────────────────────────────────────────

/// The job definition an allocation was placed from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub namespace: String,
    /// "service", "batch" or "system".
    #[serde(rename = "type")]
    pub kind: String,
    pub task_groups: Vec<TaskGroup>,
    /// Dispatch payload. Stored compressed; empty when the job has none.
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub version: u64,
}

/// A group of tasks co-located in one allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskGroup {
    pub name: String,
    pub tasks: Vec<Task>,
}

/// A single task within a task group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Task {
    pub name: String,
    pub driver: String,
    /// Grace period before a killed task is force-stopped, in milliseconds.
    #[serde(default)]
    pub kill_timeout_ms: u64,
}

// ── Allocation ────────────────────────────────────────────────────

/// What the servers want the allocation to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

/// What the client reports the allocation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl ClientStatus {
    /// Whether the allocation has finished and can be garbage collected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Lost)
    }
}

/// A unit of scheduled workload placement on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Allocation {
    pub id: AllocId,
    pub namespace: String,
    pub name: String,
    pub eval_id: String,
    pub node_id: NodeId,
    pub job_id: JobId,
    pub job: Option<Job>,
    pub task_group: String,
    pub desired_status: DesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    pub client_status: ClientStatus,
    #[serde(default)]
    pub client_description: String,
    #[serde(default)]
    pub task_states: HashMap<String, TaskState>,
    pub create_index: u64,
    pub modify_index: u64,
    /// Unix timestamp (nanoseconds) of creation.
    pub create_time: i64,
    /// Unix timestamp (nanoseconds) of the last modification.
    pub modify_time: i64,
}

/// Lifecycle state of a task inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycle {
    #[default]
    Pending,
    Running,
    Dead,
}

/// Client-reported state of a single task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskState {
    pub state: TaskLifecycle,
    pub failed: bool,
    pub restarts: u64,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

/// A single lifecycle event of a task.
///
/// `display_message` is a read-time projection of the structured fields
/// and is rebuilt by [`TaskEvent::populate_display_message`]; it is never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix timestamp (nanoseconds).
    pub time: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_message: String,
    #[serde(default)]
    pub details: HashMap<String, String>,
    #[serde(default)]
    pub fails_task: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub signal: i32,
    #[serde(default)]
    pub restart_reason: String,
    #[serde(default)]
    pub kill_reason: String,
    #[serde(default)]
    pub kill_error: String,
    #[serde(default)]
    pub kill_timeout_ms: u64,
    #[serde(default)]
    pub start_delay_ms: u64,
    #[serde(default)]
    pub driver_error: String,
    #[serde(default)]
    pub setup_error: String,
    #[serde(default)]
    pub task_signal: String,
    #[serde(default)]
    pub task_signal_reason: String,
}

/// Abbreviated allocation view returned by listing queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AllocListStub {
    pub id: AllocId,
    pub namespace: String,
    pub name: String,
    pub eval_id: String,
    pub node_id: NodeId,
    pub job_id: JobId,
    pub job_version: u64,
    pub task_group: String,
    pub desired_status: DesiredStatus,
    pub desired_description: String,
    pub client_status: ClientStatus,
    pub client_description: String,
    pub task_states: HashMap<String, TaskState>,
    pub create_index: u64,
    pub modify_index: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

impl Allocation {
    /// Build the listing view of this allocation.
    pub fn stub(&self) -> AllocListStub {
        AllocListStub {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            eval_id: self.eval_id.clone(),
            node_id: self.node_id.clone(),
            job_id: self.job_id.clone(),
            job_version: self.job.as_ref().map(|j| j.version).unwrap_or_default(),
            task_group: self.task_group.clone(),
            desired_status: self.desired_status,
            desired_description: self.desired_description.clone(),
            client_status: self.client_status,
            client_description: self.client_description.clone(),
            task_states: self.task_states.clone(),
            create_index: self.create_index,
            modify_index: self.modify_index,
            create_time: self.create_time,
            modify_time: self.modify_time,
        }
    }

    /// Names of every task in this allocation's task group.
    pub fn task_names(&self) -> Vec<String> {
        self.job
            .as_ref()
            .and_then(|job| job.task_groups.iter().find(|tg| tg.name == self.task_group))
            .map(|tg| tg.tasks.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Rebuild the display message of every task event.
    pub fn set_event_display_messages(&mut self) {
        populate_task_states(&mut self.task_states);
    }

    /// Drop the read-time event projections before the record is persisted.
    pub fn clear_event_display_messages(&mut self) {
        for state in self.task_states.values_mut() {
            for event in &mut state.events {
                event.display_message.clear();
            }
        }
    }
}

impl AllocListStub {
    /// Rebuild the display message of every task event.
    pub fn set_event_display_messages(&mut self) {
        populate_task_states(&mut self.task_states);
    }
}

fn populate_task_states(states: &mut HashMap<String, TaskState>) {
    for state in states.values_mut() {
        for event in &mut state.events {
            event.populate_display_message();
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Information about a client node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub datacenter: String,
    /// Address of the node's HTTP endpoint, also used for peer RPC.
    pub address: String,
    pub port: u16,
    /// Arbitrary labels reported at registration.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Unix timestamp of last heartbeat.
    pub last_heartbeat: u64,
}

impl NodeInfo {
    /// `host:port` of the node's RPC endpoint.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

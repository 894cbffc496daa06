//! Node-local client — allocations hosted on this node.
//!
//! The client keeps the allocations assigned to its node, applies the
//! server's desired state to them, and serves the `Allocations.*` RPC
//! methods in-process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use warpgrid_alloc::{
    AllocResourceUsage, AllocRestartRequest, AllocSignalRequest, AllocSpecificRequest,
    AllocStatsRequest, AllocStatsResponse, GenericResponse, NodeSpecificRequest, ResourceUsage,
    RpcError, TaskResourceUsage, Transport, handle_json,
};
use warpgrid_state::events::{
    TASK_KILLED, TASK_RECEIVED, TASK_RESTART_SIGNAL, TASK_SIGNALING, TASK_STARTED,
};
use warpgrid_state::{Allocation, ClientStatus, DesiredStatus, TaskEvent, TaskLifecycle};

use crate::allocdir::AllocDirs;
use crate::error::{ClientError, ClientResult};
use crate::signal::parse_signal;

/// Restart reason recorded for operator-requested restarts.
pub const USER_RESTART_REASON: &str = "User requested restart";

/// Signal reason recorded for operator-sent signals.
pub const USER_SIGNAL_REASON: &str = "User-initiated signal";

struct HostedAlloc {
    alloc: Allocation,
    usage: HashMap<String, ResourceUsage>,
}

/// The allocations run by this node.
pub struct LocalClient {
    node_id: String,
    allocs: RwLock<HashMap<String, HostedAlloc>>,
    dirs: Option<AllocDirs>,
}

impl LocalClient {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            allocs: RwLock::new(HashMap::new()),
            dirs: None,
        }
    }

    /// Give every hosted allocation a directory under `dirs`.
    pub fn with_alloc_dirs(mut self, dirs: AllocDirs) -> Self {
        self.dirs = Some(dirs);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn alloc_dirs(&self) -> Option<&AllocDirs> {
        self.dirs.as_ref()
    }

    pub fn hosts(&self, alloc_id: &str) -> bool {
        self.read().contains_key(alloc_id)
    }

    /// Copies of every hosted allocation, sorted by ID.
    pub fn allocations(&self) -> Vec<Allocation> {
        let mut allocs: Vec<_> = self.read().values().map(|h| h.alloc.clone()).collect();
        allocs.sort_by(|a, b| a.id.cmp(&b.id));
        allocs
    }

    pub fn allocation(&self, alloc_id: &str) -> Option<Allocation> {
        self.read().get(alloc_id).map(|h| h.alloc.clone())
    }

    /// Start hosting an allocation. Its tasks are marked running.
    pub fn add_alloc(&self, mut alloc: Allocation) -> ClientResult<()> {
        let tasks = alloc.task_names();
        if let Some(dirs) = &self.dirs {
            dirs.build(&alloc.id, &tasks)?;
        }

        let now = now_nanos();
        for task in &tasks {
            let state = alloc.task_states.entry(task.clone()).or_default();
            state.state = TaskLifecycle::Running;
            state.events.push(TaskEvent::new(TASK_RECEIVED, now));
            state.events.push(TaskEvent::new(TASK_STARTED, now));
        }
        alloc.node_id = self.node_id.clone();
        alloc.client_status = ClientStatus::Running;
        alloc.modify_time = now;

        info!(alloc_id = %alloc.id, tasks = tasks.len(), "hosting allocation");
        self.write().insert(
            alloc.id.clone(),
            HostedAlloc {
                alloc,
                usage: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Apply the server's view of this node's allocations.
    ///
    /// New allocations that should run are started; allocations the
    /// server no longer wants running are stopped. Returns the number
    /// of allocations whose client state changed.
    pub fn sync(&self, assigned: Vec<Allocation>) -> ClientResult<usize> {
        let mut changed = 0;
        for update in assigned {
            let known = self.hosts(&update.id);
            if !known {
                if update.desired_status == DesiredStatus::Run {
                    self.add_alloc(update)?;
                    changed += 1;
                }
                continue;
            }

            let mut allocs = self.write();
            let Some(hosted) = allocs.get_mut(&update.id) else {
                continue;
            };
            let alloc = &mut hosted.alloc;
            alloc.desired_status = update.desired_status;
            alloc.desired_description = update.desired_description;
            alloc.modify_index = update.modify_index;
            if update.job.is_some() {
                alloc.job = update.job;
            }

            if alloc.desired_status != DesiredStatus::Run && !alloc.client_status.is_terminal() {
                stop_tasks(alloc);
                debug!(alloc_id = %alloc.id, "stopped allocation on server request");
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Record a usage sample for one task.
    pub fn record_usage(&self, alloc_id: &str, task: &str, usage: ResourceUsage) -> ClientResult<()> {
        let mut allocs = self.write();
        let hosted = allocs
            .get_mut(alloc_id)
            .ok_or_else(|| ClientError::UnknownAllocation(alloc_id.to_string()))?;
        hosted.usage.insert(task.to_string(), usage);
        Ok(())
    }

    pub fn restart(&self, req: AllocRestartRequest) -> ClientResult<GenericResponse> {
        let mut allocs = self.write();
        let hosted = hosted_mut(&mut allocs, &req.alloc_id)?;
        let targets = running_targets(&hosted.alloc, &req.task_name)?;

        let now = now_nanos();
        for task in &targets {
            let state = hosted.alloc.task_states.entry(task.clone()).or_default();
            let mut event = TaskEvent::new(TASK_RESTART_SIGNAL, now);
            event.restart_reason = USER_RESTART_REASON.to_string();
            state.events.push(event);
            state.restarts += 1;
            state.events.push(TaskEvent::new(TASK_STARTED, now));
        }
        hosted.alloc.modify_time = now;

        info!(alloc_id = %req.alloc_id, tasks = ?targets, "restarted allocation tasks");
        Ok(GenericResponse::default())
    }

    pub fn signal(&self, req: AllocSignalRequest) -> ClientResult<GenericResponse> {
        let (signal, _) = parse_signal(&req.signal)?;
        let mut allocs = self.write();
        let hosted = hosted_mut(&mut allocs, &req.alloc_id)?;
        let targets = running_targets(&hosted.alloc, &req.task)?;

        let now = now_nanos();
        for task in &targets {
            let state = hosted.alloc.task_states.entry(task.clone()).or_default();
            let mut event = TaskEvent::new(TASK_SIGNALING, now);
            event.task_signal = signal.to_string();
            event.task_signal_reason = USER_SIGNAL_REASON.to_string();
            state.events.push(event);
        }
        hosted.alloc.modify_time = now;

        info!(alloc_id = %req.alloc_id, %signal, tasks = ?targets, "signaled allocation tasks");
        Ok(GenericResponse::default())
    }

    /// Stop hosting an allocation and remove its directory.
    ///
    /// Refused while a snapshot (or any other handle) holds the directory
    /// open; the allocation stays hosted in that case.
    pub fn garbage_collect(&self, alloc_id: &str) -> ClientResult<GenericResponse> {
        let mut allocs = self.write();
        if !allocs.contains_key(alloc_id) {
            return Err(ClientError::UnknownAllocation(alloc_id.to_string()));
        }
        if let Some(dirs) = &self.dirs {
            dirs.destroy(alloc_id).map_err(|e| match e.kind() {
                std::io::ErrorKind::ResourceBusy => {
                    ClientError::AllocDirInUse(alloc_id.to_string())
                }
                _ => ClientError::AllocDir(e),
            })?;
        }
        allocs.remove(alloc_id);
        drop(allocs);
        info!(%alloc_id, "garbage collected allocation");
        Ok(GenericResponse::default())
    }

    /// Garbage collect every terminal allocation.
    pub fn garbage_collect_all(&self) -> ClientResult<GenericResponse> {
        let terminal: Vec<String> = self
            .read()
            .values()
            .filter(|h| h.alloc.client_status.is_terminal())
            .map(|h| h.alloc.id.clone())
            .collect();

        for alloc_id in &terminal {
            if let Err(e) = self.garbage_collect(alloc_id) {
                warn!(%alloc_id, error = %e, "failed to garbage collect allocation");
            }
        }
        info!(count = terminal.len(), "garbage collected terminal allocations");
        Ok(GenericResponse::default())
    }

    pub fn stats(&self, req: AllocStatsRequest) -> ClientResult<AllocStatsResponse> {
        let allocs = self.read();
        let hosted = allocs
            .get(&req.alloc_id)
            .ok_or_else(|| ClientError::UnknownAllocation(req.alloc_id.clone()))?;

        let tasks = hosted.alloc.task_names();
        if !req.task.is_empty() && !tasks.contains(&req.task) {
            return Err(ClientError::UnknownTask(req.task));
        }

        let now = now_nanos();
        let mut usage = AllocResourceUsage {
            timestamp: now,
            ..Default::default()
        };
        for task in tasks {
            if !req.task.is_empty() && task != req.task {
                continue;
            }
            let sample = hosted.usage.get(&task).cloned().unwrap_or_default();
            usage.resource_usage.add(&sample);
            usage.tasks.insert(
                task,
                TaskResourceUsage {
                    resource_usage: sample,
                    timestamp: now,
                },
            );
        }

        Ok(AllocStatsResponse { stats: Some(usage) })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HostedAlloc>> {
        self.allocs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HostedAlloc>> {
        self.allocs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for LocalClient {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        debug!(%method, node_id = %self.node_id, "local allocation rpc");
        match method {
            "Allocations.Restart" => {
                handle_json(method, args, |req: AllocRestartRequest| async move {
                    self.restart(req).map_err(RpcError::from)
                })
                .await
            }
            "Allocations.Signal" => {
                handle_json(method, args, |req: AllocSignalRequest| async move {
                    self.signal(req).map_err(RpcError::from)
                })
                .await
            }
            "Allocations.GarbageCollect" => {
                handle_json(method, args, |req: AllocSpecificRequest| async move {
                    self.garbage_collect(&req.alloc_id).map_err(RpcError::from)
                })
                .await
            }
            "Allocations.GarbageCollectAll" => {
                handle_json(method, args, |_req: NodeSpecificRequest| async move {
                    self.garbage_collect_all().map_err(RpcError::from)
                })
                .await
            }
            "Allocations.Stats" => {
                handle_json(method, args, |req: AllocStatsRequest| async move {
                    self.stats(req).map_err(RpcError::from)
                })
                .await
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

fn hosted_mut<'a>(
    allocs: &'a mut HashMap<String, HostedAlloc>,
    alloc_id: &str,
) -> ClientResult<&'a mut HostedAlloc> {
    allocs
        .get_mut(alloc_id)
        .ok_or_else(|| ClientError::UnknownAllocation(alloc_id.to_string()))
}

/// Tasks an action applies to: the named task, or every running task.
fn running_targets(alloc: &Allocation, task: &str) -> ClientResult<Vec<String>> {
    let is_running = |name: &str| {
        alloc
            .task_states
            .get(name)
            .is_some_and(|s| s.state == TaskLifecycle::Running)
    };

    if !task.is_empty() {
        if !alloc.task_names().iter().any(|t| t == task) {
            return Err(ClientError::UnknownTask(task.to_string()));
        }
        if !is_running(task) {
            return Err(ClientError::TaskNotRunning(task.to_string()));
        }
        return Ok(vec![task.to_string()]);
    }

    let mut running: Vec<String> = alloc
        .task_names()
        .into_iter()
        .filter(|t| is_running(t))
        .collect();
    if running.is_empty() {
        return Err(ClientError::NoRunningTasks(alloc.id.clone()));
    }
    running.sort();
    Ok(running)
}

fn stop_tasks(alloc: &mut Allocation) {
    let now = now_nanos();
    for state in alloc.task_states.values_mut() {
        if state.state != TaskLifecycle::Dead {
            state.state = TaskLifecycle::Dead;
            state.events.push(TaskEvent::new(TASK_KILLED, now));
        }
    }
    alloc.client_status = ClientStatus::Complete;
    alloc.modify_time = now;
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

//! Node agent — client-side cluster participation.
//!
//! The agent runs on each client node. It registers the node with the
//! servers, keeps it alive with heartbeats, pulls the allocations placed
//! on it and pushes back their client state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use warpgrid_alloc::{GenericResponse, NodeSpecificRequest, RpcError, Transport};
use warpgrid_client::LocalClient;
use warpgrid_state::{Allocation, NodeInfo};

use crate::rpc::call_json;
use crate::structs::{
    NodeClientAllocsResponse, NodeHeartbeatRequest, NodeHeartbeatResponse, NodeRegisterRequest,
    NodeUpdateAllocRequest,
};

/// The node agent that maintains cluster membership.
pub struct NodeAgent {
    node: NodeInfo,
    servers: Arc<dyn Transport>,
    client: Arc<LocalClient>,
    heartbeat_interval: Duration,
    /// Client state last reported per allocation.
    reported: HashMap<String, Allocation>,
}

impl NodeAgent {
    pub fn new(node: NodeInfo, servers: Arc<dyn Transport>, client: Arc<LocalClient>) -> Self {
        Self {
            node,
            servers,
            client,
            heartbeat_interval: Duration::from_secs(5),
            reported: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register this node with the servers.
    pub async fn register(&mut self) -> Result<(), RpcError> {
        let resp: NodeHeartbeatResponse = call_json(
            self.servers.as_ref(),
            "Node.Register",
            &NodeRegisterRequest {
                node: self.node.clone(),
            },
        )
        .await?;
        self.apply_interval(&resp);
        info!(
            node_id = %self.node.id,
            heartbeat_interval = ?self.heartbeat_interval,
            "registered with servers"
        );
        Ok(())
    }

    /// Deregister this node.
    pub async fn leave(&self) -> Result<(), RpcError> {
        let _: GenericResponse = call_json(
            self.servers.as_ref(),
            "Node.Deregister",
            &NodeHeartbeatRequest {
                node_id: self.node.id.clone(),
            },
        )
        .await?;
        info!(node_id = %self.node.id, "left cluster");
        Ok(())
    }

    /// One heartbeat and allocation sync round.
    pub async fn tick(&mut self) -> Result<(), RpcError> {
        let resp: NodeHeartbeatResponse = call_json(
            self.servers.as_ref(),
            "Node.Heartbeat",
            &NodeHeartbeatRequest {
                node_id: self.node.id.clone(),
            },
        )
        .await?;
        if resp.known {
            self.apply_interval(&resp);
        } else {
            warn!(node_id = %self.node.id, "servers forgot this node, registering again");
            self.register().await?;
        }

        let assigned: NodeClientAllocsResponse = call_json(
            self.servers.as_ref(),
            "Node.GetClientAllocs",
            &NodeSpecificRequest {
                node_id: self.node.id.clone(),
                ..Default::default()
            },
        )
        .await?;
        let changed = self
            .client
            .sync(assigned.allocs)
            .map_err(|e| RpcError::Remote(e.to_string()))?;
        if changed > 0 {
            debug!(node_id = %self.node.id, changed, index = assigned.index, "allocations synced");
        }

        self.push_updates().await
    }

    /// Run heartbeat and sync rounds until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(node_id = %self.node.id, interval = ?self.heartbeat_interval, "node agent started");

        loop {
            if let Err(e) = self.tick().await {
                warn!(node_id = %self.node.id, error = %e, "heartbeat failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
                _ = shutdown.changed() => {
                    info!(node_id = %self.node.id, "node agent shutting down");
                    break;
                }
            }
        }
    }

    async fn push_updates(&mut self) -> Result<(), RpcError> {
        let pending: Vec<Allocation> = self
            .client
            .allocations()
            .into_iter()
            .filter(|alloc| {
                self.reported
                    .get(&alloc.id)
                    .is_none_or(|prev| client_state_differs(prev, alloc))
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let _: GenericResponse = call_json(
            self.servers.as_ref(),
            "Node.UpdateAlloc",
            &NodeUpdateAllocRequest {
                allocs: pending.clone(),
            },
        )
        .await?;
        debug!(node_id = %self.node.id, count = pending.len(), "pushed allocation updates");
        for alloc in pending {
            self.reported.insert(alloc.id.clone(), alloc);
        }
        Ok(())
    }

    fn apply_interval(&mut self, resp: &NodeHeartbeatResponse) {
        if resp.heartbeat_interval_ms > 0 {
            self.heartbeat_interval = Duration::from_millis(resp.heartbeat_interval_ms);
        }
    }
}

fn client_state_differs(prev: &Allocation, next: &Allocation) -> bool {
    prev.client_status != next.client_status
        || prev.client_description != next.client_description
        || prev.task_states != next.task_states
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;
    use warpgrid_state::{ClientStatus, DesiredStatus, Job, StateStore, Task, TaskGroup};

    use super::*;
    use crate::broker::ServerBroker;
    use crate::membership::MembershipManager;

    /// Broker wrapper that records method names.
    struct Recorded {
        inner: ServerBroker,
        methods: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorded {
        async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
            self.methods.lock().unwrap().push(method.to_string());
            self.inner.call(method, args).await
        }
    }

    fn node() -> NodeInfo {
        NodeInfo {
            id: "node1".to_string(),
            name: "node1".to_string(),
            datacenter: "dc1".to_string(),
            address: "127.0.0.1".to_string(),
            port: 4646,
            labels: HashMap::new(),
            last_heartbeat: 0,
        }
    }

    fn placed(id: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            node_id: "node1".to_string(),
            task_group: "web".to_string(),
            job: Some(Job {
                id: "example".to_string(),
                task_groups: vec![TaskGroup {
                    name: "web".to_string(),
                    tasks: vec![Task {
                        name: "server".to_string(),
                        ..Default::default()
                    }],
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup() -> (NodeAgent, StateStore, Arc<Recorded>, Arc<LocalClient>) {
        let state = StateStore::open_in_memory().unwrap();
        let membership = Arc::new(
            MembershipManager::new(state.clone()).with_heartbeat_interval(Duration::from_millis(250)),
        );
        let servers = Arc::new(Recorded {
            inner: ServerBroker::new(state.clone(), membership),
            methods: Mutex::new(Vec::new()),
        });
        let client = Arc::new(LocalClient::new("node1"));
        let agent = NodeAgent::new(node(), servers.clone(), client.clone());
        (agent, state, servers, client)
    }

    #[tokio::test]
    async fn register_adopts_server_interval() {
        let (mut agent, state, _, _) = setup();
        agent.register().await.unwrap();

        assert_eq!(agent.heartbeat_interval(), Duration::from_millis(250));
        assert!(state.get_node("node1").unwrap().is_some());
    }

    #[tokio::test]
    async fn tick_reregisters_unknown_node() {
        let (mut agent, state, servers, _) = setup();
        agent.tick().await.unwrap();

        let methods = servers.methods.lock().unwrap().clone();
        assert_eq!(&methods[..2], &["Node.Heartbeat", "Node.Register"]);
        assert!(state.get_node("node1").unwrap().is_some());
    }

    #[tokio::test]
    async fn tick_starts_placed_allocs_and_reports_them() {
        let (mut agent, state, _, client) = setup();
        agent.register().await.unwrap();
        state.put_alloc(&placed("a1")).unwrap();

        agent.tick().await.unwrap();

        assert!(client.hosts("a1"));
        let stored = state.get_alloc("a1").unwrap().unwrap();
        assert_eq!(stored.client_status, ClientStatus::Running);
        assert!(stored.task_states.contains_key("server"));
    }

    #[tokio::test]
    async fn unchanged_state_is_not_pushed_again() {
        let (mut agent, state, servers, _) = setup();
        agent.register().await.unwrap();
        state.put_alloc(&placed("a1")).unwrap();
        agent.tick().await.unwrap();
        servers.methods.lock().unwrap().clear();

        agent.tick().await.unwrap();

        let methods = servers.methods.lock().unwrap().clone();
        assert!(!methods.iter().any(|m| m == "Node.UpdateAlloc"));
    }

    #[tokio::test]
    async fn server_stop_reaches_client() {
        let (mut agent, state, _, client) = setup();
        agent.register().await.unwrap();
        state.put_alloc(&placed("a1")).unwrap();
        agent.tick().await.unwrap();

        state.stop_alloc("a1", "eval-1", 0).unwrap();
        agent.tick().await.unwrap();

        let hosted = client.allocation("a1").unwrap();
        assert_eq!(hosted.desired_status, DesiredStatus::Stop);
        assert!(hosted.client_status.is_terminal());
        assert!(state.get_alloc("a1").unwrap().unwrap().client_status.is_terminal());
    }

    #[tokio::test]
    async fn leave_deregisters() {
        let (mut agent, state, _, _) = setup();
        agent.register().await.unwrap();
        agent.leave().await.unwrap();
        assert!(state.get_node("node1").unwrap().is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (mut agent, _, _, _) = setup();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { agent.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn differs_ignores_server_fields() {
        let a = placed("a1");
        let mut b = a.clone();
        b.modify_index = 99;
        assert!(!client_state_differs(&a, &b));
        b.client_status = ClientStatus::Failed;
        assert!(client_state_differs(&a, &b));
    }
}

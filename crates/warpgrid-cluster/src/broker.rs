//! Server-side allocation broker.
//!
//! Answers `Alloc.*` from the state store, serves the `Node.*` methods
//! used by clients, and forwards `ClientAllocations.*` to the node that
//! owns the allocation as the matching `Allocations.*` call.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use warpgrid_alloc::{
    AllocListRequest, AllocListResponse, AllocSpecificRequest, AllocStopRequest,
    AllocStopResponse, GenericResponse, NodeSpecificRequest, QueryMeta, RpcError,
    SingleAllocResponse, Transport, handle_json,
};
use warpgrid_state::{NodeInfo, StateError, StateStore};

use crate::membership::MembershipManager;
use crate::rpc::HttpRpcTransport;
use crate::structs::{
    NodeClientAllocsResponse, NodeHeartbeatRequest, NodeHeartbeatResponse, NodeRegisterRequest,
    NodeUpdateAllocRequest,
};

/// Opens a transport to a client node.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node: &NodeInfo) -> Arc<dyn Transport>;
}

/// Connects to nodes over peer RPC at their advertised address.
pub struct HttpNodeConnector;

impl NodeConnector for HttpNodeConnector {
    fn connect(&self, node: &NodeInfo) -> Arc<dyn Transport> {
        Arc::new(HttpRpcTransport::new(node.id.clone(), node.rpc_addr()))
    }
}

/// The server role's RPC handler.
pub struct ServerBroker {
    state: StateStore,
    membership: Arc<MembershipManager>,
    connector: Arc<dyn NodeConnector>,
}

impl ServerBroker {
    pub fn new(state: StateStore, membership: Arc<MembershipManager>) -> Self {
        Self {
            state,
            membership,
            connector: Arc::new(HttpNodeConnector),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn NodeConnector>) -> Self {
        self.connector = connector;
        self
    }

    fn meta(&self) -> Result<QueryMeta, RpcError> {
        Ok(QueryMeta {
            index: self.state.latest_index().map_err(state_err)?,
            last_contact_ms: 0,
            known_leader: true,
        })
    }

    fn list(&self, req: AllocListRequest) -> Result<AllocListResponse, RpcError> {
        let namespace = req.query.namespace;
        let allocs = self
            .state
            .list_allocs(&req.query.prefix)
            .map_err(state_err)?
            .into_iter()
            .filter(|a| namespace.is_empty() || a.namespace == namespace)
            .map(|a| a.stub())
            .collect();
        Ok(AllocListResponse {
            allocations: Some(allocs),
            meta: self.meta()?,
        })
    }

    fn get(&self, req: AllocSpecificRequest) -> Result<SingleAllocResponse, RpcError> {
        Ok(SingleAllocResponse {
            alloc: self.state.get_alloc(&req.alloc_id).map_err(state_err)?,
            meta: self.meta()?,
        })
    }

    fn stop(&self, req: AllocStopRequest) -> Result<AllocStopResponse, RpcError> {
        let eval_id = uuid::Uuid::new_v4().to_string();
        let index = self
            .state
            .stop_alloc(&req.alloc_id, &eval_id, now_nanos())
            .map_err(state_err)?;
        info!(alloc_id = %req.alloc_id, %eval_id, index, "allocation stop requested");
        Ok(AllocStopResponse { eval_id, index })
    }

    fn register(&self, req: NodeRegisterRequest) -> Result<NodeHeartbeatResponse, RpcError> {
        self.membership.register(req.node).map_err(state_err)?;
        Ok(self.heartbeat_reply(true))
    }

    fn heartbeat(&self, req: NodeHeartbeatRequest) -> Result<NodeHeartbeatResponse, RpcError> {
        let known = self.membership.heartbeat(&req.node_id).map_err(state_err)?;
        Ok(self.heartbeat_reply(known))
    }

    fn heartbeat_reply(&self, known: bool) -> NodeHeartbeatResponse {
        NodeHeartbeatResponse {
            heartbeat_interval_ms: self.membership.heartbeat_interval().as_millis() as u64,
            known,
        }
    }

    fn deregister(&self, req: NodeHeartbeatRequest) -> Result<GenericResponse, RpcError> {
        self.membership.leave(&req.node_id).map_err(state_err)?;
        Ok(GenericResponse {
            index: self.state.latest_index().map_err(state_err)?,
        })
    }

    fn client_allocs(&self, req: NodeSpecificRequest) -> Result<NodeClientAllocsResponse, RpcError> {
        Ok(NodeClientAllocsResponse {
            allocs: self
                .state
                .list_allocs_by_node(&req.node_id)
                .map_err(state_err)?,
            index: self.state.latest_index().map_err(state_err)?,
        })
    }

    fn update_allocs(&self, req: NodeUpdateAllocRequest) -> Result<GenericResponse, RpcError> {
        let mut index = 0;
        for alloc in &req.allocs {
            match self.state.update_alloc_client_state(alloc).map_err(state_err)? {
                Some(i) => index = i,
                None => debug!(alloc_id = %alloc.id, "client update for unknown allocation"),
            }
        }
        Ok(GenericResponse { index })
    }

    /// Forward a client-routed call to the node that owns the target.
    async fn forward(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        let Some((_, op)) = method.split_once('.') else {
            return Err(RpcError::UnknownMethod(method.to_string()));
        };

        let node_id = if op == "GarbageCollectAll" {
            let node_id = string_field(&args, "node_id");
            if node_id.is_empty() {
                return Err(RpcError::BadRequest("missing node id".to_string()));
            }
            node_id
        } else {
            let alloc_id = string_field(&args, "alloc_id");
            match self.state.get_alloc(&alloc_id).map_err(state_err)? {
                Some(alloc) => alloc.node_id,
                None => return Err(RpcError::UnknownAllocation { alloc_id }),
            }
        };

        let Some(node) = self.membership.reachable(&node_id).map_err(state_err)? else {
            warn!(%node_id, %method, "owning node is not reachable");
            return Err(RpcError::NoNodeConnection { node_id });
        };

        let target = format!("Allocations.{op}");
        debug!(%node_id, method = %target, "forwarding to client node");
        self.connector.connect(&node).call(&target, args).await
    }
}

#[async_trait]
impl Transport for ServerBroker {
    async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        match method {
            "Alloc.List" => {
                handle_json(method, args, |req| async move { self.list(req) }).await
            }
            "Alloc.GetAlloc" => {
                handle_json(method, args, |req| async move { self.get(req) }).await
            }
            "Alloc.Stop" => {
                handle_json(method, args, |req| async move { self.stop(req) }).await
            }
            "Node.Register" => {
                handle_json(method, args, |req| async move { self.register(req) }).await
            }
            "Node.Heartbeat" => {
                handle_json(method, args, |req| async move { self.heartbeat(req) }).await
            }
            "Node.Deregister" => {
                handle_json(method, args, |req| async move { self.deregister(req) }).await
            }
            "Node.GetClientAllocs" => {
                handle_json(method, args, |req| async move { self.client_allocs(req) }).await
            }
            "Node.UpdateAlloc" => {
                handle_json(method, args, |req| async move { self.update_allocs(req) }).await
            }
            m if m.starts_with("ClientAllocations.") => self.forward(method, args).await,
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

fn string_field(args: &Value, field: &str) -> String {
    args.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn state_err(err: StateError) -> RpcError {
    match err {
        StateError::AllocNotFound(alloc_id) => RpcError::UnknownAllocation { alloc_id },
        other => RpcError::Remote(other.to_string()),
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use warpgrid_state::{Allocation, DesiredStatus};

    use super::*;

    /// Records forwarded calls per node.
    #[derive(Default)]
    struct RecordingConnector {
        calls: Arc<Mutex<Vec<(String, String, Value)>>>,
    }

    struct NodeEcho {
        node_id: String,
        calls: Arc<Mutex<Vec<(String, String, Value)>>>,
    }

    #[async_trait]
    impl Transport for NodeEcho {
        async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
            self.calls
                .lock()
                .unwrap()
                .push((self.node_id.clone(), method.to_string(), args));
            Ok(json!({"index": 0}))
        }
    }

    impl NodeConnector for RecordingConnector {
        fn connect(&self, node: &NodeInfo) -> Arc<dyn Transport> {
            Arc::new(NodeEcho {
                node_id: node.id.clone(),
                calls: self.calls.clone(),
            })
        }
    }

    fn node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            name: id.to_string(),
            datacenter: "dc1".to_string(),
            address: "127.0.0.1".to_string(),
            port: 4646,
            labels: HashMap::new(),
            last_heartbeat: 0,
        }
    }

    fn alloc(id: &str, node_id: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    fn broker() -> (ServerBroker, StateStore, Arc<RecordingConnector>) {
        let state = StateStore::open_in_memory().unwrap();
        let membership = Arc::new(MembershipManager::new(state.clone()));
        let connector = Arc::new(RecordingConnector::default());
        let broker = ServerBroker::new(state.clone(), membership).with_connector(connector.clone());
        (broker, state, connector)
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let (broker, state, _) = broker();
        state.put_alloc(&alloc("abc1", "node1")).unwrap();
        state.put_alloc(&alloc("abd2", "node1")).unwrap();
        state.put_alloc(&alloc("zzz3", "node1")).unwrap();

        let reply = broker
            .call("Alloc.List", json!({"query": {"prefix": "ab"}}))
            .await
            .unwrap();
        let resp: AllocListResponse = serde_json::from_value(reply).unwrap();

        let ids: Vec<_> = resp.allocations.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["abc1", "abd2"]);
        assert_eq!(resp.meta.index, 3);
        assert!(resp.meta.known_leader);
    }

    #[tokio::test]
    async fn list_empty_store_is_empty_list() {
        let (broker, _, _) = broker();
        let reply = broker.call("Alloc.List", json!({})).await.unwrap();
        assert_eq!(reply["allocations"], json!([]));
    }

    #[tokio::test]
    async fn get_missing_alloc_is_null() {
        let (broker, _, _) = broker();
        let reply = broker
            .call("Alloc.GetAlloc", json!({"alloc_id": "nope"}))
            .await
            .unwrap();
        assert!(reply["alloc"].is_null());
    }

    #[tokio::test]
    async fn stop_marks_alloc_and_creates_eval() {
        let (broker, state, _) = broker();
        state.put_alloc(&alloc("a1", "node1")).unwrap();

        let reply = broker
            .call("Alloc.Stop", json!({"alloc_id": "a1"}))
            .await
            .unwrap();
        let resp: AllocStopResponse = serde_json::from_value(reply).unwrap();

        let stored = state.get_alloc("a1").unwrap().unwrap();
        assert_eq!(stored.desired_status, DesiredStatus::Stop);
        assert_eq!(stored.eval_id, resp.eval_id);
        assert_eq!(stored.modify_index, resp.index);
    }

    #[tokio::test]
    async fn stop_unknown_alloc_is_unknown_allocation() {
        let (broker, _, _) = broker();
        let err = broker
            .call("Alloc.Stop", json!({"alloc_id": "ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownAllocation { .. }));
    }

    #[tokio::test]
    async fn client_call_is_forwarded_to_owning_node() {
        let (broker, state, connector) = broker();
        broker.call("Node.Register", json!({"node": node("node1")})).await.unwrap();
        state.put_alloc(&alloc("a1", "node1")).unwrap();

        broker
            .call(
                "ClientAllocations.Signal",
                json!({"alloc_id": "a1", "signal": "SIGHUP"}),
            )
            .await
            .unwrap();

        let calls = connector.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "node1");
        assert_eq!(calls[0].1, "Allocations.Signal");
        assert_eq!(calls[0].2["signal"], "SIGHUP");
    }

    #[tokio::test]
    async fn client_call_for_unknown_alloc_is_unknown_allocation() {
        let (broker, _, connector) = broker();
        let err = broker
            .call("ClientAllocations.Stats", json!({"alloc_id": "ghost"}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::UnknownAllocation {
                alloc_id: "ghost".to_string()
            }
        );
        assert!(connector.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gc_all_for_unregistered_node_is_no_connection() {
        let (broker, _, _) = broker();
        let err = broker
            .call("ClientAllocations.GarbageCollectAll", json!({"node_id": "node1"}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::NoNodeConnection {
                node_id: "node1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn gc_all_without_node_id_is_bad_request() {
        let (broker, _, _) = broker();
        let err = broker
            .call("ClientAllocations.GarbageCollectAll", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::BadRequest(_)));
    }

    #[tokio::test]
    async fn dead_node_is_not_forwarded_to() {
        let state = StateStore::open_in_memory().unwrap();
        let membership = Arc::new(
            MembershipManager::new(state.clone()).with_dead_timeout(Duration::from_secs(0)),
        );
        let connector = Arc::new(RecordingConnector::default());
        let broker = ServerBroker::new(state.clone(), membership.clone())
            .with_connector(connector.clone());
        membership.register(node("node1")).unwrap();
        let mut stale = state.get_node("node1").unwrap().unwrap();
        stale.last_heartbeat = 1000;
        state.put_node(&stale).unwrap();
        state.put_alloc(&alloc("a1", "node1")).unwrap();

        let err = broker
            .call("ClientAllocations.Restart", json!({"alloc_id": "a1"}))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::NoNodeConnection { .. }));
        assert!(connector.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_sync_round_trip() {
        let (broker, state, _) = broker();
        let reply = broker
            .call("Node.Register", json!({"node": node("node1")}))
            .await
            .unwrap();
        assert_eq!(reply["known"], true);
        state.put_alloc(&alloc("a1", "node1")).unwrap();
        state.put_alloc(&alloc("b1", "node2")).unwrap();

        let reply = broker
            .call("Node.GetClientAllocs", json!({"node_id": "node1"}))
            .await
            .unwrap();
        let resp: NodeClientAllocsResponse = serde_json::from_value(reply).unwrap();
        assert_eq!(resp.allocs.len(), 1);

        let mut report = resp.allocs[0].clone();
        report.client_status = warpgrid_state::ClientStatus::Complete;
        broker
            .call("Node.UpdateAlloc", json!({"allocs": [report]}))
            .await
            .unwrap();
        assert_eq!(
            state.get_alloc("a1").unwrap().unwrap().client_status,
            warpgrid_state::ClientStatus::Complete
        );
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_node_asks_for_registration() {
        let (broker, _, _) = broker();
        let reply = broker
            .call("Node.Heartbeat", json!({"node_id": "ghost"}))
            .await
            .unwrap();
        assert_eq!(reply["known"], false);
    }
}

//! Agent assembly — wires the server and client roles into one router.
//!
//! Depending on the configured roles, the daemon:
//! 1. Opens the state store and starts the allocation broker (server)
//! 2. Builds the local client with its allocation directories (client)
//! 3. Derives the topology and transports for the allocation endpoint
//! 4. Serves the HTTP API and peer RPC on one listener
//! 5. Registers with the servers and runs the heartbeat loop (client)
//! 6. On shutdown, deregisters and stops background tasks

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use warpgrid_alloc::{AllocEndpoint, ContextResolver, Dispatcher, Transport, Transports};
use warpgrid_api::ApiState;
use warpgrid_client::{AgentTopology, AllocDirs, ClientSnapshots, LocalClient, MigrateTokens};
use warpgrid_cluster::{MembershipManager, NodeAgent, RpcMux, ServerBroker, ServerPool};
use warpgrid_state::{
    Allocation, DesiredStatus, Job, NodeInfo, StateStore, Task, TaskGroup,
};

use crate::config::AgentConfig;

/// A fully wired agent, ready to serve.
pub struct Agent {
    config: AgentConfig,
    api: ApiState,
    state: Option<StateStore>,
    membership: Option<Arc<MembershipManager>>,
    node_agent: Option<NodeAgent>,
}

impl Agent {
    /// Build the roles enabled in `config`.
    ///
    /// `state` backs the server role; it is ignored when the server is
    /// disabled.
    pub fn build(config: AgentConfig, state: Option<StateStore>) -> anyhow::Result<Self> {
        let server_enabled = config.server.enabled;
        let client_enabled = config.client.enabled;
        anyhow::ensure!(
            server_enabled || client_enabled,
            "at least one of the server and client roles must be enabled"
        );

        let mut mux = RpcMux::new();
        let mut transports = Transports::default();
        let mut membership = None;
        let mut server_state = None;

        if server_enabled {
            let state = state.context("server role needs a state store")?;
            let members = Arc::new(
                MembershipManager::new(state.clone())
                    .with_dead_timeout(config.dead_node_timeout()?),
            );
            let broker: Arc<dyn Transport> =
                Arc::new(ServerBroker::new(state.clone(), members.clone()));
            mux = mux
                .register("Alloc", broker.clone())
                .register("Node", broker.clone())
                .register("ClientAllocations", broker.clone());
            transports = transports.with_server(broker);
            membership = Some(members);
            server_state = Some(state);
            info!("server role enabled");
        }

        let mut client = None;
        let mut snapshots = None;
        let mut node_agent = None;

        if client_enabled {
            let node_id = if config.client.node_id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                config.client.node_id.clone()
            };
            let secret = if config.client.migrate_secret.is_empty() {
                warn!("no migrate secret configured, generating one for this run");
                uuid::Uuid::new_v4().to_string()
            } else {
                config.client.migrate_secret.clone()
            };

            let dirs = AllocDirs::new(config.alloc_dir());
            let local = Arc::new(LocalClient::new(node_id.clone()).with_alloc_dirs(dirs.clone()));
            mux = mux.register("Allocations", local.clone());
            transports = transports.with_local(local.clone());
            snapshots = Some(Arc::new(ClientSnapshots::new(
                local.clone(),
                dirs,
                MigrateTokens::new(secret),
            )));

            // An agent with its own server talks to it in-process.
            let servers: Arc<dyn Transport> = match (&membership, config.client.servers.is_empty()) {
                (Some(_), _) => mux_handle(&mux),
                (None, false) => {
                    let pool: Arc<dyn Transport> = Arc::new(ServerPool::new(&config.client.servers));
                    transports = transports.with_client(pool.clone());
                    pool
                }
                (None, true) => anyhow::bail!("client-only agent needs at least one server address"),
            };

            let (address, port) = config.advertise()?;
            let node = NodeInfo {
                id: node_id.clone(),
                name: node_id.clone(),
                datacenter: config.datacenter.clone(),
                address,
                port,
                labels: HashMap::new(),
                last_heartbeat: 0,
            };
            node_agent = Some(NodeAgent::new(node, servers, local.clone()));
            info!(%node_id, "client role enabled");
            client = Some(local);
        }

        let topology = AgentTopology::new(
            client,
            !config.client.servers.is_empty(),
            server_enabled,
        );
        let dispatcher = Dispatcher::new(transports).with_timeout(config.rpc_timeout()?);
        let mut allocs = AllocEndpoint::new(ContextResolver::new(Arc::new(topology)), dispatcher);
        if let Some(snapshots) = snapshots {
            allocs = allocs.with_snapshots(snapshots);
        }

        Ok(Self {
            config,
            api: ApiState {
                allocs,
                rpc: Arc::new(mux),
            },
            state: server_state,
            membership,
            node_agent,
        })
    }

    pub fn api_state(&self) -> ApiState {
        self.api.clone()
    }

    /// Place example allocations on this agent's own node.
    pub fn seed_dev_allocs(&self) -> anyhow::Result<()> {
        let (Some(state), Some(agent)) = (&self.state, &self.node_agent) else {
            return Ok(());
        };
        for (id, group) in [("web", "frontend"), ("cache", "backend")] {
            let alloc = example_alloc(id, group, agent.node_id());
            state.put_alloc(&alloc)?;
            info!(alloc_id = %alloc.id, node_id = %agent.node_id(), "seeded dev allocation");
        }
        Ok(())
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            api,
            membership,
            node_agent,
            ..
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = warpgrid_api::build_router(api);
        let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.http_port)
            .parse()
            .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

        info!(%addr, "HTTP server starting");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        // Dead node reaper.
        let reaper_handle = membership.map(|members| {
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(15));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match members.reap_dead_nodes() {
                                Ok(reaped) if !reaped.is_empty() => {
                                    info!(count = reaped.len(), "reaped dead nodes");
                                }
                                Err(e) => {
                                    warn!(error = %e, "dead node reaper error");
                                }
                                _ => {}
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        });

        // Heartbeat loop. Registration waits for the listener so a
        // colocated server can reach this node.
        let heartbeat_handle = node_agent.map(|mut agent| {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.register().await {
                    warn!(error = %e, "initial registration failed, retrying on heartbeat");
                }
                agent.run(shutdown).await;
                if let Err(e) = agent.leave().await {
                    warn!(error = %e, "deregistration failed");
                }
            })
        });

        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        server.await?;

        if let Some(handle) = heartbeat_handle {
            let _ = handle.await;
        }
        if let Some(handle) = reaper_handle {
            let _ = handle.await;
        }

        info!("agent stopped");
        Ok(())
    }
}

/// The mux as a transport, for a client talking to its own server.
fn mux_handle(mux: &RpcMux) -> Arc<dyn Transport> {
    Arc::new(mux.clone())
}

fn example_alloc(id: &str, group: &str, node_id: &str) -> Allocation {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    Allocation {
        id: format!("{id}-{}", uuid::Uuid::new_v4()),
        namespace: "default".to_string(),
        name: format!("example.{group}[0]"),
        node_id: node_id.to_string(),
        job_id: "example".to_string(),
        job: Some(Job {
            id: "example".to_string(),
            name: "example".to_string(),
            namespace: "default".to_string(),
            kind: "service".to_string(),
            task_groups: vec![TaskGroup {
                name: group.to_string(),
                tasks: vec![Task {
                    name: id.to_string(),
                    driver: "exec".to_string(),
                    kill_timeout_ms: 5000,
                }],
            }],
            ..Default::default()
        }),
        task_group: group.to_string(),
        desired_status: DesiredStatus::Run,
        create_time: now,
        modify_time: now,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: bool, client: bool) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.data_dir = std::env::temp_dir().join("warpd-test");
        config.server.enabled = server;
        config.client.enabled = client;
        config.client.node_id = "node1".to_string();
        config
    }

    #[test]
    fn no_roles_is_rejected() {
        assert!(Agent::build(config(false, false), None).is_err());
    }

    #[test]
    fn client_only_needs_servers() {
        assert!(Agent::build(config(false, true), None).is_err());

        let mut cfg = config(false, true);
        cfg.client.servers = vec!["127.0.0.1:4646".to_string()];
        assert!(Agent::build(cfg, None).is_ok());
    }

    #[test]
    fn server_needs_state() {
        assert!(Agent::build(config(true, false), None).is_err());
        let state = StateStore::open_in_memory().unwrap();
        assert!(Agent::build(config(true, false), Some(state)).is_ok());
    }

    #[test]
    fn dev_seed_places_allocs_on_own_node() {
        let state = StateStore::open_in_memory().unwrap();
        let agent = Agent::build(config(true, true), Some(state.clone())).unwrap();
        agent.seed_dev_allocs().unwrap();

        let placed = state.list_allocs_by_node("node1").unwrap();
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|a| !a.task_names().is_empty()));
    }
}

//! Membership manager — tracks client nodes known to the servers.
//!
//! Nodes register through peer RPC and keep themselves alive with
//! heartbeats. A node whose last heartbeat is older than the dead
//! timeout is reported `Dead` and is no longer reachable for brokered
//! allocation calls.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use warpgrid_state::*;

/// Status of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Ready,
    Dead,
}

/// In-memory view of a cluster member.
#[derive(Debug, Clone)]
pub struct Member {
    pub node: NodeInfo,
    pub status: MemberStatus,
}

/// Manages cluster membership state.
///
/// Persists node information to the `StateStore`; status is derived from
/// heartbeat age on every read.
pub struct MembershipManager {
    state: StateStore,
    /// Dead node detection threshold.
    dead_timeout: Duration,
    /// Heartbeat interval expected from clients.
    heartbeat_interval: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            dead_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    /// Set the dead node detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    /// Set the expected heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register (or re-register) a node.
    pub fn register(&self, mut node: NodeInfo) -> StateResult<()> {
        node.last_heartbeat = epoch_secs();
        self.state.put_node(&node)?;
        info!(node_id = %node.id, address = %node.rpc_addr(), "node registered");
        Ok(())
    }

    /// Process a heartbeat. Returns false for unknown nodes.
    pub fn heartbeat(&self, node_id: &str) -> StateResult<bool> {
        match self.state.get_node(node_id)? {
            Some(mut n) => {
                n.last_heartbeat = epoch_secs();
                self.state.put_node(&n)?;
                debug!(%node_id, "heartbeat received");
                Ok(true)
            }
            None => {
                warn!(%node_id, "heartbeat from unknown node");
                Ok(false)
            }
        }
    }

    /// Remove a node from the cluster.
    pub fn leave(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.state.delete_node(node_id)?;
        if existed {
            info!(%node_id, "node left cluster");
        }
        Ok(existed)
    }

    /// List all current members with their status.
    pub fn list_members(&self) -> StateResult<Vec<Member>> {
        let now = epoch_secs();
        Ok(self
            .state
            .list_nodes()?
            .into_iter()
            .map(|node| self.member(node, now))
            .collect())
    }

    /// Get a single member by ID.
    pub fn get_member(&self, node_id: &str) -> StateResult<Option<Member>> {
        let now = epoch_secs();
        Ok(self.state.get_node(node_id)?.map(|node| self.member(node, now)))
    }

    /// The node's RPC details, if it is registered and alive.
    pub fn reachable(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        Ok(self
            .get_member(node_id)?
            .filter(|m| m.status == MemberStatus::Ready)
            .map(|m| m.node))
    }

    /// Detect and remove dead nodes.
    ///
    /// Returns the IDs of nodes that were removed.
    pub fn reap_dead_nodes(&self) -> StateResult<Vec<String>> {
        let mut reaped = Vec::new();
        for member in self.list_members()? {
            if member.status == MemberStatus::Dead {
                self.state.delete_node(&member.node.id)?;
                warn!(node_id = %member.node.id, "reaped dead node");
                reaped.push(member.node.id);
            }
        }
        Ok(reaped)
    }

    /// Count of ready (alive) nodes.
    pub fn ready_count(&self) -> StateResult<usize> {
        let members = self.list_members()?;
        Ok(members.iter().filter(|m| m.status == MemberStatus::Ready).count())
    }

    fn member(&self, node: NodeInfo, now: u64) -> Member {
        let status = if now.saturating_sub(node.last_heartbeat) > self.dead_timeout.as_secs() {
            MemberStatus::Dead
        } else {
            MemberStatus::Ready
        };
        Member { node, status }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

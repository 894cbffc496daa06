use std::sync::Arc;

use warpgrid_alloc::Topology;

use crate::client::LocalClient;

/// Topology of a running agent, derived from the roles it runs.
///
/// The client channel exists only for a client-only agent that knows at
/// least one server; an agent that also runs a server brokers directly.
pub struct AgentTopology {
    client: Option<Arc<LocalClient>>,
    servers_configured: bool,
    server: bool,
}

impl AgentTopology {
    pub fn new(client: Option<Arc<LocalClient>>, servers_configured: bool, server: bool) -> Self {
        Self {
            client,
            servers_configured,
            server,
        }
    }
}

impl Topology for AgentTopology {
    fn local_node_id(&self) -> Option<String> {
        self.client.as_ref().map(|c| c.node_id().to_string())
    }

    fn hosts_alloc(&self, alloc_id: &str) -> bool {
        self.client.as_ref().is_some_and(|c| c.hosts(alloc_id))
    }

    fn has_client_channel(&self) -> bool {
        self.client.is_some() && self.servers_configured && !self.server
    }

    fn has_server(&self) -> bool {
        self.server
    }
}

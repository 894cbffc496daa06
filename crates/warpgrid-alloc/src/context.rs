//! Execution context resolution.
//!
//! Picks the single transport class that may serve a request, from
//! locally cached topology only. The precedence is fixed:
//! `Local`, then `ClientChannel`, then `ServerChannel`, else `Unavailable`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

/// Where an operation will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// In-process call into this agent's own client.
    Local,
    /// This agent's client forwards the call over its server connection.
    ClientChannel,
    /// This agent's server brokers the call to the owning node.
    ServerChannel,
    /// No path exists.
    Unavailable,
}

/// What a request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// An allocation-scoped operation.
    Alloc(&'a str),
    /// A node-scoped operation; an empty ID means "the local node".
    Node(&'a str),
    /// A server-authoritative operation with no node affinity.
    Servers,
}

/// Locality oracle consulted by the resolver.
///
/// Implementations answer from cached state and must not block on I/O.
pub trait Topology: Send + Sync {
    /// ID of the node run by this agent's client, if it has one.
    fn local_node_id(&self) -> Option<String>;

    /// Whether this agent's client currently hosts the allocation.
    fn hosts_alloc(&self, alloc_id: &str) -> bool;

    /// Whether this agent can forward calls over a client-to-server channel.
    fn has_client_channel(&self) -> bool;

    /// Whether this agent runs a server that can broker calls.
    fn has_server(&self) -> bool;
}

/// Resolves a [`Target`] to exactly one [`ExecutionContext`].
#[derive(Clone)]
pub struct ContextResolver {
    topology: Arc<dyn Topology>,
}

impl ContextResolver {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Self { topology }
    }

    pub fn resolve(&self, target: Target<'_>) -> ExecutionContext {
        let local = match target {
            Target::Alloc(alloc_id) => {
                self.topology.local_node_id().is_some() && self.topology.hosts_alloc(alloc_id)
            }
            Target::Node(node_id) => match self.topology.local_node_id() {
                Some(local_id) => node_id.is_empty() || node_id == local_id,
                None => false,
            },
            Target::Servers => false,
        };

        // Server-authoritative calls prefer the in-process server over forwarding.
        let ctx = if local {
            ExecutionContext::Local
        } else if matches!(target, Target::Servers) && self.topology.has_server() {
            ExecutionContext::ServerChannel
        } else if self.topology.has_client_channel() {
            ExecutionContext::ClientChannel
        } else if self.topology.has_server() {
            ExecutionContext::ServerChannel
        } else {
            ExecutionContext::Unavailable
        };

        debug!(?target, context = ?ctx, "resolved execution context");
        ctx
    }
}

/// A fixed topology snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    pub local_node: Option<String>,
    pub local_allocs: HashSet<String>,
    pub client_channel: bool,
    pub server: bool,
}

impl StaticTopology {
    pub fn with_local_node(mut self, node_id: &str) -> Self {
        self.local_node = Some(node_id.to_string());
        self
    }

    pub fn with_local_alloc(mut self, alloc_id: &str) -> Self {
        self.local_allocs.insert(alloc_id.to_string());
        self
    }

    pub fn with_client_channel(mut self) -> Self {
        self.client_channel = true;
        self
    }

    pub fn with_server(mut self) -> Self {
        self.server = true;
        self
    }
}

impl Topology for StaticTopology {
    fn local_node_id(&self) -> Option<String> {
        self.local_node.clone()
    }

    fn hosts_alloc(&self, alloc_id: &str) -> bool {
        self.local_allocs.contains(alloc_id)
    }

    fn has_client_channel(&self) -> bool {
        self.client_channel
    }

    fn has_server(&self) -> bool {
        self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(topology: StaticTopology) -> ContextResolver {
        ContextResolver::new(Arc::new(topology))
    }

    #[test]
    fn local_alloc_wins() {
        let r = resolver(
            StaticTopology::default()
                .with_local_node("node1")
                .with_local_alloc("a1")
                .with_client_channel()
                .with_server(),
        );
        assert_eq!(r.resolve(Target::Alloc("a1")), ExecutionContext::Local);
    }

    #[test]
    fn unknown_alloc_uses_client_channel_before_server() {
        let r = resolver(
            StaticTopology::default()
                .with_local_node("node1")
                .with_client_channel()
                .with_server(),
        );
        assert_eq!(r.resolve(Target::Alloc("a2")), ExecutionContext::ClientChannel);
    }

    #[test]
    fn server_only_agent_brokers() {
        let r = resolver(StaticTopology::default().with_server());
        assert_eq!(r.resolve(Target::Alloc("a1")), ExecutionContext::ServerChannel);
        assert_eq!(r.resolve(Target::Node("node1")), ExecutionContext::ServerChannel);
    }

    #[test]
    fn nothing_available() {
        let r = resolver(StaticTopology::default());
        assert_eq!(r.resolve(Target::Alloc("a1")), ExecutionContext::Unavailable);
        assert_eq!(r.resolve(Target::Node("")), ExecutionContext::Unavailable);
        assert_eq!(r.resolve(Target::Servers), ExecutionContext::Unavailable);
    }

    #[test]
    fn hosted_alloc_without_local_client_is_not_local() {
        let mut topology = StaticTopology::default().with_server();
        topology.local_allocs.insert("a1".to_string());
        assert_eq!(
            resolver(topology).resolve(Target::Alloc("a1")),
            ExecutionContext::ServerChannel
        );
    }

    #[test]
    fn node_target_matches_local_or_empty() {
        let r = resolver(StaticTopology::default().with_local_node("node1").with_client_channel());
        assert_eq!(r.resolve(Target::Node("")), ExecutionContext::Local);
        assert_eq!(r.resolve(Target::Node("node1")), ExecutionContext::Local);
        assert_eq!(r.resolve(Target::Node("node2")), ExecutionContext::ClientChannel);
    }

    #[test]
    fn servers_target_prefers_in_process_server() {
        let r = resolver(
            StaticTopology::default()
                .with_local_node("node1")
                .with_client_channel()
                .with_server(),
        );
        assert_eq!(r.resolve(Target::Servers), ExecutionContext::ServerChannel);

        let client_only = resolver(StaticTopology::default().with_local_node("n").with_client_channel());
        assert_eq!(client_only.resolve(Target::Servers), ExecutionContext::ClientChannel);
    }

    #[test]
    fn resolution_is_idempotent() {
        let topologies = [
            StaticTopology::default(),
            StaticTopology::default().with_server(),
            StaticTopology::default().with_local_node("n1").with_client_channel(),
            StaticTopology::default()
                .with_local_node("n1")
                .with_local_alloc("a1")
                .with_server(),
        ];
        let targets = [
            Target::Alloc("a1"),
            Target::Alloc("zz"),
            Target::Node(""),
            Target::Node("n1"),
            Target::Node("n2"),
            Target::Servers,
        ];
        for topology in topologies {
            let r = resolver(topology);
            for target in targets {
                let first = r.resolve(target);
                for _ in 0..3 {
                    assert_eq!(r.resolve(target), first);
                }
            }
        }
    }
}

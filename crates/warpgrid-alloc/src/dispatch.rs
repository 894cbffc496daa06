//! RPC dispatch over the transport bound to an execution context.
//!
//! Each logical [`Operation`] maps to one fully-qualified method name per
//! transport class through a static table, so verbs never special-case
//! the transport they end up on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::{NO_ROUTE, RpcError};

/// Default deadline for a single dispatched call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// A callable RPC endpoint.
///
/// Requests and replies travel as JSON values so one trait covers
/// in-process handlers and peer connections alike.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError>;
}

/// Logical allocation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Stop,
    Restart,
    Signal,
    GarbageCollect,
    GarbageCollectAll,
    Stats,
}

/// Method names of one operation on each transport class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSet {
    pub local: &'static str,
    pub channel: &'static str,
    pub server: &'static str,
}

impl MethodSet {
    const fn uniform(method: &'static str) -> Self {
        Self {
            local: method,
            channel: method,
            server: method,
        }
    }

    const fn client(local: &'static str, remote: &'static str) -> Self {
        Self {
            local,
            channel: remote,
            server: remote,
        }
    }
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::List,
        Operation::Get,
        Operation::Stop,
        Operation::Restart,
        Operation::Signal,
        Operation::GarbageCollect,
        Operation::GarbageCollectAll,
        Operation::Stats,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::List => "List",
            Self::Get => "Get",
            Self::Stop => "Stop",
            Self::Restart => "Restart",
            Self::Signal => "Signal",
            Self::GarbageCollect => "GarbageCollect",
            Self::GarbageCollectAll => "GarbageCollectAll",
            Self::Stats => "Stats",
        }
    }

    pub const fn methods(self) -> MethodSet {
        match self {
            Self::List => MethodSet::uniform("Alloc.List"),
            Self::Get => MethodSet::uniform("Alloc.GetAlloc"),
            Self::Stop => MethodSet::uniform("Alloc.Stop"),
            Self::Restart => {
                MethodSet::client("Allocations.Restart", "ClientAllocations.Restart")
            }
            Self::Signal => MethodSet::client("Allocations.Signal", "ClientAllocations.Signal"),
            Self::GarbageCollect => MethodSet::client(
                "Allocations.GarbageCollect",
                "ClientAllocations.GarbageCollect",
            ),
            Self::GarbageCollectAll => MethodSet::client(
                "Allocations.GarbageCollectAll",
                "ClientAllocations.GarbageCollectAll",
            ),
            Self::Stats => MethodSet::client("Allocations.Stats", "ClientAllocations.Stats"),
        }
    }

    /// The method name to issue on the transport bound to `ctx`.
    pub const fn method_for(self, ctx: ExecutionContext) -> Option<&'static str> {
        let set = self.methods();
        match ctx {
            ExecutionContext::Local => Some(set.local),
            ExecutionContext::ClientChannel => Some(set.channel),
            ExecutionContext::ServerChannel => Some(set.server),
            ExecutionContext::Unavailable => None,
        }
    }
}

/// Transport capabilities injected at construction.
#[derive(Clone, Default)]
pub struct Transports {
    /// This agent's own client.
    pub local: Option<Arc<dyn Transport>>,
    /// This agent's client-to-server forwarding channel.
    pub client: Option<Arc<dyn Transport>>,
    /// This agent's own server.
    pub server: Option<Arc<dyn Transport>>,
}

impl Transports {
    pub fn with_local(mut self, transport: Arc<dyn Transport>) -> Self {
        self.local = Some(transport);
        self
    }

    pub fn with_client(mut self, transport: Arc<dyn Transport>) -> Self {
        self.client = Some(transport);
        self
    }

    pub fn with_server(mut self, transport: Arc<dyn Transport>) -> Self {
        self.server = Some(transport);
        self
    }

    fn for_context(&self, ctx: ExecutionContext) -> Option<&Arc<dyn Transport>> {
        match ctx {
            ExecutionContext::Local => self.local.as_ref(),
            ExecutionContext::ClientChannel => self.client.as_ref(),
            ExecutionContext::ServerChannel => self.server.as_ref(),
            ExecutionContext::Unavailable => None,
        }
    }
}

/// Issues typed requests over the transport selected by a context.
///
/// Holds no per-call state. Errors are returned unclassified.
#[derive(Clone)]
pub struct Dispatcher {
    transports: Transports,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(transports: Transports) -> Self {
        Self {
            transports,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set the default per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue `op` on the transport bound to `ctx`.
    ///
    /// `deadline` shortens the default timeout, never extends it. Dropping
    /// the returned future abandons the outbound wait.
    pub async fn dispatch<Req, Resp>(
        &self,
        ctx: ExecutionContext,
        op: Operation,
        args: &Req,
        deadline: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let method = op
            .method_for(ctx)
            .ok_or_else(|| RpcError::BadRequest(NO_ROUTE.to_string()))?;
        let transport = self.transports.for_context(ctx).ok_or_else(|| {
            RpcError::BadRequest(format!("no transport configured for {ctx:?}"))
        })?;

        let args = serde_json::to_value(args)
            .map_err(|e| RpcError::Transport(format!("encode {method} request: {e}")))?;
        let timeout = deadline.map_or(self.timeout, |d| d.min(self.timeout));

        debug!(%method, context = ?ctx, ?timeout, "dispatching rpc");

        let reply = match tokio::time::timeout(timeout, transport.call(method, args)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(%method, context = ?ctx, error = %e, "rpc failed");
                return Err(e);
            }
            Err(_) => {
                warn!(%method, context = ?ctx, ?timeout, "rpc deadline elapsed");
                return Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        serde_json::from_value(reply)
            .map_err(|e| RpcError::Transport(format!("decode {method} reply: {e}")))
    }
}

/// Decode a JSON request, run a handler, and encode its reply.
///
/// Shared by the in-process transports.
pub async fn handle_json<Req, Resp, F, Fut>(
    method: &str,
    args: serde_json::Value,
    handler: F,
) -> Result<serde_json::Value, RpcError>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: std::future::Future<Output = Result<Resp, RpcError>>,
{
    let req: Req = serde_json::from_value(args)
        .map_err(|e| RpcError::BadRequest(format!("invalid {method} request: {e}")))?;
    let resp = handler(req).await?;
    serde_json::to_value(resp)
        .map_err(|e| RpcError::Transport(format!("encode {method} reply: {e}")))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every call and answers from a canned result.
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<(String, serde_json::Value)>>,
        pub reply: Result<serde_json::Value, RpcError>,
        pub delay: Option<Duration>,
    }

    impl RecordingTransport {
        pub fn replying(reply: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Ok(reply),
                delay: None,
            })
        }

        pub fn failing(err: RpcError) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Err(err),
                delay: None,
            })
        }

        pub fn stalling(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Ok(serde_json::json!({})),
                delay: Some(delay),
            })
        }

        pub fn methods(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn call(
            &self,
            method: &str,
            args: serde_json::Value,
        ) -> Result<serde_json::Value, RpcError> {
            self.calls.lock().unwrap().push((method.to_string(), args));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply.clone()
        }
    }
}

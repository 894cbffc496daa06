//! Peer RPC over HTTP.
//!
//! Every agent exposes `POST /v1/internal/rpc/{method}`. The request body
//! is the JSON request envelope; a 2xx reply carries the JSON reply
//! envelope and any other status carries a JSON [`RpcError`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use warpgrid_alloc::{RpcError, Transport};

/// Path prefix of the peer RPC endpoint.
pub const RPC_PATH_PREFIX: &str = "/v1/internal/rpc/";

/// Transport that posts calls to one peer agent.
pub struct HttpRpcTransport {
    /// Reported in `NoNodeConnection` errors.
    node_id: String,
    addr: String,
}

impl HttpRpcTransport {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
        }
    }

    /// A transport to a server, identified by its address.
    pub fn server(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(addr.clone(), addr)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn no_connection(&self) -> RpcError {
        RpcError::NoNodeConnection {
            node_id: self.node_id.clone(),
        }
    }

    /// Make one call, keeping a local connect failure apart from an error
    /// the peer replied with.
    async fn send(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, CallFailure> {
        let path = format!("{RPC_PATH_PREFIX}{method}");

        let stream = tokio::net::TcpStream::connect(&self.addr)
            .await
            .map_err(|e| {
                debug!(error = %e, addr = %self.addr, %method, "peer rpc connection failed");
                CallFailure::Connect(self.no_connection())
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| {
                debug!(error = %e, addr = %self.addr, %method, "peer rpc handshake failed");
                CallFailure::Connect(self.no_connection())
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let body = serde_json::to_vec(&args)
            .map_err(|e| RpcError::Transport(format!("encode {method} request: {e}")))?;
        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(&path)
            .header(http::header::HOST, &self.addr)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::USER_AGENT, "warpgrid-cluster/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RpcError::Transport(format!("{method} to {}: {e}", self.addr)))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Transport(format!("read {method} reply: {e}")))?
            .to_bytes();

        if status.is_success() {
            return serde_json::from_slice(&bytes)
                .map_err(|e| RpcError::Transport(format!("decode {method} reply: {e}")).into());
        }

        Err(serde_json::from_slice::<RpcError>(&bytes)
            .unwrap_or_else(|_| {
                RpcError::Remote(format!("{status}: {}", String::from_utf8_lossy(&bytes)))
            })
            .into())
    }
}

/// Why a single peer call failed.
enum CallFailure {
    /// The peer could not be reached; nothing was sent.
    Connect(RpcError),
    /// The request was sent. Covers errors the peer replied with.
    Reply(RpcError),
}

impl From<RpcError> for CallFailure {
    fn from(err: RpcError) -> Self {
        CallFailure::Reply(err)
    }
}

impl From<CallFailure> for RpcError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Connect(err) | CallFailure::Reply(err) => err,
        }
    }
}

#[async_trait]
impl Transport for HttpRpcTransport {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        Ok(self.send(method, args).await?)
    }
}

/// Transport to the configured servers.
///
/// Calls go to one server at a time. A server that cannot be connected to
/// is skipped in favour of the next; once a request has been sent, its
/// outcome (including an error the server replied with) is final. The last
/// server that answered is tried first next time.
pub struct ServerPool {
    servers: Vec<HttpRpcTransport>,
    preferred: AtomicUsize,
}

impl ServerPool {
    pub fn new(addrs: &[String]) -> Self {
        Self {
            servers: addrs.iter().map(HttpRpcTransport::server).collect(),
            preferred: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[async_trait]
impl Transport for ServerPool {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let count = self.servers.len();
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last = RpcError::Transport("no servers configured".to_string());

        for offset in 0..count {
            let idx = (start + offset) % count;
            let server = &self.servers[idx];
            match server.send(method, args.clone()).await {
                Err(CallFailure::Connect(err)) => {
                    warn!(addr = %server.addr(), %method, "server unreachable, trying next");
                    last = err;
                }
                Err(CallFailure::Reply(err)) => {
                    self.preferred.store(idx, Ordering::Relaxed);
                    return Err(err);
                }
                Ok(reply) => {
                    self.preferred.store(idx, Ordering::Relaxed);
                    return Ok(reply);
                }
            }
        }

        Err(last)
    }
}

/// Routes inbound peer RPC calls to handlers by service name.
#[derive(Clone, Default)]
pub struct RpcMux {
    services: HashMap<String, Arc<dyn Transport>>,
}

impl RpcMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every `{service}.*` method with `handler`.
    pub fn register(mut self, service: &str, handler: Arc<dyn Transport>) -> Self {
        self.services.insert(service.to_string(), handler);
        self
    }
}

#[async_trait]
impl Transport for RpcMux {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let service = method.split_once('.').map_or(method, |(service, _)| service);
        match self.services.get(service) {
            Some(handler) => handler.call(method, args).await,
            None => Err(RpcError::UnknownMethod(method.to_string())),
        }
    }
}

/// Make a typed call over any transport.
pub async fn call_json<Req, Resp>(
    transport: &dyn Transport,
    method: &str,
    req: &Req,
) -> Result<Resp, RpcError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let args = serde_json::to_value(req)
        .map_err(|e| RpcError::Transport(format!("encode {method} request: {e}")))?;
    let reply = transport.call(method, args).await?;
    serde_json::from_value(reply)
        .map_err(|e| RpcError::Transport(format!("decode {method} reply: {e}")))
}

//! Allocation operation verbs.
//!
//! Every verb follows the same shape: build the request envelope, resolve
//! one execution context, dispatch once, classify any failure once. There
//! is no retry across contexts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use warpgrid_state::{AllocListStub, Allocation};

use crate::codec::{DeflateCodec, PayloadCodec, decode_job_payload};
use crate::context::{ContextResolver, ExecutionContext, Target};
use crate::dispatch::{Dispatcher, Operation};
use crate::error::{
    ALLOC_NOT_FOUND, ALLOCATION_NOT_FOUND, ApiError, ApiResult, CLIENT_NOT_RUNNING, NO_ROUTE,
    classify,
};
use crate::snapshot::{SnapshotSource, SnapshotStart, SnapshotStream, start_snapshot};
use crate::structs::{
    AllocListRequest, AllocListResponse, AllocResourceUsage, AllocRestartRequest,
    AllocSignalRequest, AllocSpecificRequest, AllocStatsRequest, AllocStatsResponse,
    AllocStopRequest, AllocStopResponse, GenericResponse, NodeSpecificRequest, QueryMeta,
    SingleAllocResponse,
};

/// Front door for allocation operations.
#[derive(Clone)]
pub struct AllocEndpoint {
    resolver: ContextResolver,
    dispatcher: Dispatcher,
    codec: Arc<dyn PayloadCodec>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
}

impl AllocEndpoint {
    pub fn new(resolver: ContextResolver, dispatcher: Dispatcher) -> Self {
        Self {
            resolver,
            dispatcher,
            codec: Arc::new(DeflateCodec),
            snapshots: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Enable snapshots; only agents running a client have a source.
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// List allocation stubs. Always a sequence, possibly empty.
    pub async fn list(
        &self,
        req: AllocListRequest,
    ) -> ApiResult<(Vec<AllocListStub>, QueryMeta)> {
        let deadline = req.query.deadline();
        let resp: AllocListResponse = self
            .route(Target::Servers, Operation::List, &req, deadline)
            .await?;

        let mut allocs = resp.allocations.unwrap_or_default();
        for stub in &mut allocs {
            stub.set_event_display_messages();
        }
        Ok((allocs, resp.meta))
    }

    /// Fetch one allocation with its job payload decoded.
    pub async fn get(
        &self,
        req: AllocSpecificRequest,
    ) -> ApiResult<(Arc<Allocation>, QueryMeta)> {
        let deadline = req.query.deadline();
        let resp: SingleAllocResponse = self
            .route(Target::Servers, Operation::Get, &req, deadline)
            .await?;

        let Some(alloc) = resp.alloc else {
            return Err(ApiError::not_found(ALLOC_NOT_FOUND));
        };

        let mut alloc = decode_job_payload(Arc::new(alloc), self.codec.as_ref())
            .map_err(|e| ApiError::internal(e.to_string()))?;
        // Sole owner at this point, so this mutates in place.
        Arc::make_mut(&mut alloc).set_event_display_messages();
        Ok((alloc, resp.meta))
    }

    /// Mark an allocation for stopping through the servers.
    pub async fn stop(
        &self,
        alloc_id: &str,
        mut req: AllocStopRequest,
    ) -> ApiResult<AllocStopResponse> {
        req.alloc_id = alloc_id.to_string();
        let deadline = req.write.deadline();
        self.route(Target::Servers, Operation::Stop, &req, deadline)
            .await
    }

    pub async fn restart(
        &self,
        alloc_id: &str,
        mut req: AllocRestartRequest,
    ) -> ApiResult<GenericResponse> {
        req.alloc_id = alloc_id.to_string();
        let deadline = req.query.deadline();
        self.route(Target::Alloc(alloc_id), Operation::Restart, &req, deadline)
            .await
    }

    pub async fn signal(
        &self,
        alloc_id: &str,
        mut req: AllocSignalRequest,
    ) -> ApiResult<GenericResponse> {
        req.alloc_id = alloc_id.to_string();
        let deadline = req.query.deadline();
        self.route(Target::Alloc(alloc_id), Operation::Signal, &req, deadline)
            .await
    }

    pub async fn gc(
        &self,
        alloc_id: &str,
        mut req: AllocSpecificRequest,
    ) -> ApiResult<GenericResponse> {
        req.alloc_id = alloc_id.to_string();
        let deadline = req.query.deadline();
        self.route(
            Target::Alloc(alloc_id),
            Operation::GarbageCollect,
            &req,
            deadline,
        )
        .await
    }

    /// Garbage collect every terminal allocation on a node.
    pub async fn gc_all(&self, req: NodeSpecificRequest) -> ApiResult<GenericResponse> {
        let deadline = req.query.deadline();
        let node_id = req.node_id.clone();
        self.route(
            Target::Node(&node_id),
            Operation::GarbageCollectAll,
            &req,
            deadline,
        )
        .await
    }

    /// Resource usage of an allocation; only the inner payload is returned.
    pub async fn stats(
        &self,
        alloc_id: &str,
        mut req: AllocStatsRequest,
    ) -> ApiResult<Option<AllocResourceUsage>> {
        req.alloc_id = alloc_id.to_string();
        let deadline = req.query.deadline();
        let resp: AllocStatsResponse = self
            .route(Target::Alloc(alloc_id), Operation::Stats, &req, deadline)
            .await?;
        Ok(resp.stats)
    }

    /// Stream a snapshot archive of a locally hosted allocation.
    ///
    /// The migrate token is checked before anything else is touched.
    pub async fn snapshot(&self, alloc_id: &str, token: &str) -> ApiResult<SnapshotStream> {
        let Some(source) = &self.snapshots else {
            return Err(ApiError::bad_request(CLIENT_NOT_RUNNING));
        };

        if !source.validate_migrate_token(alloc_id, token) {
            warn!(%alloc_id, "snapshot rejected: invalid migrate token");
            return Err(ApiError::permission_denied());
        }

        let fs = source.alloc_fs(alloc_id).map_err(|e| {
            debug!(%alloc_id, error = %e, "allocation fs unavailable");
            ApiError::not_found(ALLOCATION_NOT_FOUND)
        })?;

        match start_snapshot(alloc_id, fs).await {
            SnapshotStart::Streaming(stream) => Ok(stream),
            SnapshotStart::Failed(e) => {
                Err(ApiError::internal(format!("error making snapshot: {e}")))
            }
        }
    }

    async fn route<Req, Resp>(
        &self,
        target: Target<'_>,
        op: Operation,
        req: &Req,
        deadline: Option<Duration>,
    ) -> ApiResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let ctx = self.resolver.resolve(target);
        if ctx == ExecutionContext::Unavailable {
            return Err(ApiError::bad_request(NO_ROUTE));
        }

        self.dispatcher
            .dispatch(ctx, op, req, deadline)
            .await
            .map_err(|e| classify(&e))
    }
}

//! Allocation API handlers.
//!
//! Each handler parses the request, calls one `AllocEndpoint` verb and
//! renders the result in the `ApiResponse` envelope.

use std::collections::HashMap;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use warpgrid_alloc::error::RESOURCE_NOT_FOUND;
use warpgrid_alloc::{
    AllocListRequest, AllocRestartBody, AllocRestartRequest, AllocSignalRequest,
    AllocSpecificRequest, AllocStatsRequest, AllocStopRequest, ApiError, NodeSpecificRequest,
    RpcError, Transport,
};

use crate::ApiState;
use crate::query::{RequestParams, set_index, set_meta};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    /// Success with no payload.
    fn ack() -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn api_error(err: ApiError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(&err.message, status)
}

fn is_write(method: &Method) -> bool {
    method == Method::POST || method == Method::PUT
}

/// Decode a JSON body; an empty body decodes as the default value.
fn decode_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Failed to decode body: {e}")))
}

// ── Allocations ────────────────────────────────────────────────

/// GET /v1/allocations
pub async fn list_allocations(
    State(state): State<ApiState>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return api_error(ApiError::method_not_allowed());
    }
    let params = RequestParams::new(query, &headers);
    let query = match params.query_options() {
        Ok(q) => q,
        Err(e) => return api_error(e),
    };

    match state.allocs.list(AllocListRequest { query }).await {
        Ok((allocs, meta)) => {
            let mut resp = ApiResponse::ok(allocs).into_response();
            set_meta(resp.headers_mut(), &meta);
            resp
        }
        Err(e) => api_error(e),
    }
}

/// /v1/allocation/{id} and /v1/allocation/{id}/stop
pub async fn allocation_request(
    State(state): State<ApiState>,
    method: Method,
    Path(rest): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let params = RequestParams::new(query, &headers);
    let tokens: Vec<&str> = rest.split('/').collect();
    match tokens.as_slice() {
        [alloc_id] => alloc_get(&state, &method, alloc_id, &params).await,
        [alloc_id, "stop"] => alloc_stop(&state, &method, alloc_id, &params).await,
        _ => error_response(RESOURCE_NOT_FOUND, StatusCode::NOT_FOUND),
    }
}

async fn alloc_get(
    state: &ApiState,
    method: &Method,
    alloc_id: &str,
    params: &RequestParams,
) -> Response {
    if method != Method::GET {
        return api_error(ApiError::method_not_allowed());
    }
    let query = match params.query_options() {
        Ok(q) => q,
        Err(e) => return api_error(e),
    };
    let req = AllocSpecificRequest {
        alloc_id: alloc_id.to_string(),
        query,
    };

    match state.allocs.get(req).await {
        Ok((alloc, meta)) => {
            let mut resp = ApiResponse::ok(&*alloc).into_response();
            set_meta(resp.headers_mut(), &meta);
            resp
        }
        Err(e) => api_error(e),
    }
}

async fn alloc_stop(
    state: &ApiState,
    method: &Method,
    alloc_id: &str,
    params: &RequestParams,
) -> Response {
    if !is_write(method) {
        return api_error(ApiError::method_not_allowed());
    }
    let write = match params.write_request() {
        Ok(w) => w,
        Err(e) => return api_error(e),
    };
    let req = AllocStopRequest {
        alloc_id: String::new(),
        write,
    };

    match state.allocs.stop(alloc_id, req).await {
        Ok(ack) => {
            let index = ack.index;
            let mut resp = ApiResponse::ok(ack).into_response();
            set_index(resp.headers_mut(), index);
            resp
        }
        Err(e) => api_error(e),
    }
}

// ── Client allocation actions ──────────────────────────────────

/// /v1/client/allocation/{id}/{action}
pub async fn client_allocation_request(
    State(state): State<ApiState>,
    method: Method,
    Path(rest): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let params = RequestParams::new(query, &headers);
    let tokens: Vec<&str> = rest.split('/').collect();
    let [alloc_id, action] = tokens.as_slice() else {
        return error_response(RESOURCE_NOT_FOUND, StatusCode::NOT_FOUND);
    };
    debug!(%alloc_id, %action, %method, "client allocation request");

    let result = match *action {
        "stats" => alloc_stats(&state, alloc_id, &params).await,
        "snapshot" => return alloc_snapshot(&state, alloc_id, &params).await,
        "restart" => alloc_restart(&state, &method, alloc_id, &params, &body).await,
        "gc" => alloc_gc(&state, alloc_id, &params).await,
        "signal" => alloc_signal(&state, &method, alloc_id, &params, &body).await,
        _ => return error_response(RESOURCE_NOT_FOUND, StatusCode::NOT_FOUND),
    };
    result.unwrap_or_else(api_error)
}

async fn alloc_stats(
    state: &ApiState,
    alloc_id: &str,
    params: &RequestParams,
) -> Result<Response, ApiError> {
    let req = AllocStatsRequest {
        alloc_id: String::new(),
        task: params.get("task").to_string(),
        query: params.query_options()?,
    };
    let stats = state.allocs.stats(alloc_id, req).await?;
    Ok(ApiResponse::ok(stats).into_response())
}

async fn alloc_snapshot(state: &ApiState, alloc_id: &str, params: &RequestParams) -> Response {
    match state.allocs.snapshot(alloc_id, params.token()).await {
        Ok(stream) => (
            [(header::CONTENT_TYPE, "application/gzip")],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(e) => {
            warn!(%alloc_id, error = %e, "snapshot failed");
            api_error(e)
        }
    }
}

async fn alloc_restart(
    state: &ApiState,
    method: &Method,
    alloc_id: &str,
    params: &RequestParams,
    body: &[u8],
) -> Result<Response, ApiError> {
    if !is_write(method) {
        return Err(ApiError::method_not_allowed());
    }
    let query = params.query_options()?;
    // The body can only name a task; the path names the allocation.
    let body: AllocRestartBody = decode_body(body)?;
    let req = AllocRestartRequest {
        alloc_id: String::new(),
        task_name: body.task_name,
        query,
    };
    let ack = state.allocs.restart(alloc_id, req).await?;
    Ok(ApiResponse::ok(ack).into_response())
}

async fn alloc_gc(
    state: &ApiState,
    alloc_id: &str,
    params: &RequestParams,
) -> Result<Response, ApiError> {
    let req = AllocSpecificRequest {
        alloc_id: String::new(),
        query: params.query_options()?,
    };
    state.allocs.gc(alloc_id, req).await?;
    Ok(ApiResponse::ack().into_response())
}

async fn alloc_signal(
    state: &ApiState,
    method: &Method,
    alloc_id: &str,
    params: &RequestParams,
    body: &[u8],
) -> Result<Response, ApiError> {
    if !is_write(method) {
        return Err(ApiError::method_not_allowed());
    }
    let mut req: AllocSignalRequest = decode_body(body)?;
    req.query = params.query_options()?;
    let ack = state.allocs.signal(alloc_id, req).await?;
    Ok(ApiResponse::ok(ack).into_response())
}

/// /v1/client/gc?node_id=
pub async fn client_gc(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let params = RequestParams::new(query, &headers);
    let query = match params.query_options() {
        Ok(q) => q,
        Err(e) => return api_error(e),
    };
    let req = NodeSpecificRequest {
        node_id: params.get("node_id").to_string(),
        query,
    };

    match state.allocs.gc_all(req).await {
        Ok(_) => ApiResponse::ack().into_response(),
        Err(e) => api_error(e),
    }
}

// ── Peer RPC ───────────────────────────────────────────────────

/// POST /v1/internal/rpc/{method}
pub async fn internal_rpc(
    State(state): State<ApiState>,
    Path(method): Path<String>,
    body: Bytes,
) -> Response {
    let result = match serde_json::from_slice(&body) {
        Ok(args) => state.rpc.call(&method, args).await,
        Err(e) => Err(RpcError::BadRequest(format!("invalid {method} request: {e}"))),
    };

    match result {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            debug!(%method, error = %e, "peer rpc failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(e)).into_response()
        }
    }
}

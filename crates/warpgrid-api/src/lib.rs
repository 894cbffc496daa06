//! warpgrid-api — HTTP API for WarpGrid agents.
//!
//! Provides the axum routes for allocation operations and the internal
//! peer RPC endpoint. Every allocation route goes through one
//! `AllocEndpoint` verb; method checks happen inside the handlers so an
//! unsupported method gets the `ApiResponse` envelope with a 405.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v1/allocations` | List allocations |
//! | GET | `/v1/allocation/{id}` | Get an allocation |
//! | POST/PUT | `/v1/allocation/{id}/stop` | Stop an allocation |
//! | GET | `/v1/client/allocation/{id}/stats` | Resource usage |
//! | GET | `/v1/client/allocation/{id}/snapshot` | Stream a snapshot archive |
//! | POST/PUT | `/v1/client/allocation/{id}/restart` | Restart tasks |
//! | any | `/v1/client/allocation/{id}/gc` | Garbage collect an allocation |
//! | POST/PUT | `/v1/client/allocation/{id}/signal` | Signal tasks |
//! | any | `/v1/client/gc` | Garbage collect a node |
//! | POST | `/v1/internal/rpc/{method}` | Peer RPC |

pub mod handlers;
pub mod query;

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, post};
use warpgrid_alloc::{AllocEndpoint, Transport};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub allocs: AllocEndpoint,
    /// Handler behind the peer RPC endpoint.
    pub rpc: Arc<dyn Transport>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/allocations", any(handlers::list_allocations))
        .route("/v1/allocation/{*rest}", any(handlers::allocation_request))
        .route(
            "/v1/client/allocation/{*rest}",
            any(handlers::client_allocation_request),
        )
        .route("/v1/client/gc", any(handlers::client_gc))
        .route("/v1/internal/rpc/{method}", post(handlers::internal_rpc))
        .with_state(state)
}

//! warpgrid-state — embedded allocation state for WarpGrid servers.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for allocations and cluster nodes.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Allocations are keyed by their ID, so a prefix scan over the table
//! answers ID-prefix listing queries in ID order. Every write bumps a
//! store-wide raft-style index that callers surface as query metadata.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod events;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

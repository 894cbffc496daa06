//! warpgrid-client — the node-local half of a WarpGrid agent.
//!
//! A client hosts allocations placed on its node and answers the
//! `Allocations.*` RPC methods for them in-process. It also owns the
//! per-allocation directories and the migrate tokens that authorize
//! peers to snapshot them.
//!
//! ```text
//! LocalClient ── Transport (Allocations.Restart/Signal/GC/GCAll/Stats)
//!   ├── AllocDirs ── AllocDir (AllocFs: gzip snapshot archive)
//!   └── AgentTopology (Topology for the context resolver)
//! ClientSnapshots ── SnapshotSource (MigrateTokens + AllocDirs)
//! ```

pub mod allocdir;
pub mod client;
pub mod error;
pub mod signal;
pub mod snapshot;
pub mod tokens;
pub mod topology;

pub use allocdir::{AllocDir, AllocDirs};
pub use client::LocalClient;
pub use error::{ClientError, ClientResult};
pub use snapshot::ClientSnapshots;
pub use tokens::MigrateTokens;
pub use topology::AgentTopology;

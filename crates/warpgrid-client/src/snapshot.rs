use std::sync::Arc;

use warpgrid_alloc::{AllocFs, SnapshotError, SnapshotSource};

use crate::allocdir::AllocDirs;
use crate::client::LocalClient;
use crate::tokens::MigrateTokens;

/// Snapshot source backed by the client's allocation directories.
pub struct ClientSnapshots {
    client: Arc<LocalClient>,
    dirs: AllocDirs,
    tokens: MigrateTokens,
}

impl ClientSnapshots {
    pub fn new(client: Arc<LocalClient>, dirs: AllocDirs, tokens: MigrateTokens) -> Self {
        Self {
            client,
            dirs,
            tokens,
        }
    }
}

impl SnapshotSource for ClientSnapshots {
    fn validate_migrate_token(&self, alloc_id: &str, token: &str) -> bool {
        self.tokens.validate(alloc_id, token)
    }

    fn alloc_fs(&self, alloc_id: &str) -> Result<Box<dyn AllocFs>, SnapshotError> {
        if !self.client.hosts(alloc_id) {
            return Err(SnapshotError::UnknownAllocation(alloc_id.to_string()));
        }
        Ok(Box::new(self.dirs.open(alloc_id)?))
    }
}

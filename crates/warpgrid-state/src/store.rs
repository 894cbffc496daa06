//! StateStore — redb-backed allocation persistence for WarpGrid servers.
//!
//! Provides typed CRUD operations over allocations and nodes. All values
//! are JSON-serialized into redb's `&[u8]` value columns. Every allocation
//! write bumps the store-wide modify index inside the same transaction.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Description recorded on allocations stopped through the API.
pub const ALLOC_STOPPED_DESCRIPTION: &str = "alloc was stopped by an operator";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Increment and return the modify index within an open write transaction.
    fn bump_index(txn: &WriteTransaction) -> StateResult<u64> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let current = meta
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        meta.insert(INDEX_KEY, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    /// The index of the most recent write (0 for an empty store).
    pub fn latest_index(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(INDEX_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update an allocation. Returns the index of the write.
    ///
    /// The create index of an existing record is preserved. Event display
    /// messages are stripped before the record is written.
    pub fn put_alloc(&self, alloc: &Allocation) -> StateResult<u64> {
        let mut record = alloc.clone();
        record.clear_event_display_messages();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = Self::bump_index(&txn)?;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            let existing_create_index = match table.get(record.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let prev: Allocation =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                    Some(prev.create_index)
                }
                None => None,
            };
            record.create_index = existing_create_index.unwrap_or(index);
            record.modify_index = index;

            let value = serde_json::to_vec(&record).map_err(map_err!(Codec))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(alloc_id = %record.id, index, "allocation stored");
        Ok(index)
    }

    /// Get an allocation by ID.
    pub fn get_alloc(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        match table.get(alloc_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let alloc: Allocation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(alloc))
            }
            None => Ok(None),
        }
    }

    /// List allocations whose ID starts with `prefix`, in ID order.
    ///
    /// An empty prefix lists every allocation.
    pub fn list_allocs(&self, prefix: &str) -> StateResult<Vec<Allocation>> {
        self.scan_allocs(|alloc| alloc.id.starts_with(prefix))
    }

    /// List allocations placed on the given node.
    pub fn list_allocs_by_node(&self, node_id: &str) -> StateResult<Vec<Allocation>> {
        self.scan_allocs(|alloc| alloc.node_id == node_id)
    }

    fn scan_allocs(&self, keep: impl Fn(&Allocation) -> bool) -> StateResult<Vec<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let alloc: Allocation =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            if keep(&alloc) {
                results.push(alloc);
            }
        }
        Ok(results)
    }

    /// Mark an allocation for stopping and record the evaluation that
    /// will reschedule it. Returns the index of the write.
    pub fn stop_alloc(&self, alloc_id: &str, eval_id: &str, now_nanos: i64) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            let mut alloc: Allocation = match table.get(alloc_id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?,
                None => return Err(StateError::AllocNotFound(alloc_id.to_string())),
            };

            index = Self::bump_index(&txn)?;
            alloc.desired_status = DesiredStatus::Stop;
            alloc.desired_description = ALLOC_STOPPED_DESCRIPTION.to_string();
            alloc.eval_id = eval_id.to_string();
            alloc.modify_index = index;
            alloc.modify_time = now_nanos;

            let value = serde_json::to_vec(&alloc).map_err(map_err!(Codec))?;
            table
                .insert(alloc_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%alloc_id, %eval_id, index, "allocation stopped");
        Ok(index)
    }

    /// Merge a client's report of an allocation into the stored record.
    ///
    /// Only client-owned fields are taken from `update`. Returns the write
    /// index, or `None` when the allocation is unknown.
    pub fn update_alloc_client_state(&self, update: &Allocation) -> StateResult<Option<u64>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            let mut alloc: Allocation = match table.get(update.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?,
                None => return Ok(None),
            };

            index = Self::bump_index(&txn)?;
            alloc.client_status = update.client_status;
            alloc.client_description = update.client_description.clone();
            alloc.task_states = update.task_states.clone();
            alloc.clear_event_display_messages();
            alloc.modify_index = index;
            alloc.modify_time = update.modify_time;

            let value = serde_json::to_vec(&alloc).map_err(map_err!(Codec))?;
            table
                .insert(update.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(alloc_id = %update.id, index, "allocation client state updated");
        Ok(Some(index))
    }

    /// Delete an allocation by ID. Returns true if it existed.
    pub fn delete_alloc(&self, alloc_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            existed = table.remove(alloc_id).map_err(map_err!(Write))?.is_some();
        }
        if existed {
            Self::bump_index(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%alloc_id, existed, "allocation deleted");
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update node info.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get node info by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeInfo =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeInfo =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TASK_STARTED;
    use std::collections::HashMap;

    fn test_alloc(id: &str, node_id: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            name: format!("web.api[{id}]"),
            eval_id: "eval-1".to_string(),
            node_id: node_id.to_string(),
            job_id: "web".to_string(),
            job: Some(Job {
                id: "web".to_string(),
                name: "web".to_string(),
                namespace: "default".to_string(),
                kind: "service".to_string(),
                task_groups: vec![TaskGroup {
                    name: "api".to_string(),
                    tasks: vec![Task {
                        name: "server".to_string(),
                        driver: "wasm".to_string(),
                        kill_timeout_ms: 5000,
                    }],
                }],
                ..Default::default()
            }),
            task_group: "api".to_string(),
            client_status: ClientStatus::Running,
            create_time: 1000,
            modify_time: 1000,
            ..Default::default()
        }
    }

    fn test_node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            name: id.to_string(),
            datacenter: "dc1".to_string(),
            address: "10.0.0.1".to_string(),
            port: 4646,
            labels: HashMap::new(),
            last_heartbeat: 1000,
        }
    }

    // ── Allocation CRUD ────────────────────────────────────────────

    #[test]
    fn alloc_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let alloc = test_alloc("a1", "node-1");

        let index = store.put_alloc(&alloc).unwrap();
        let retrieved = store.get_alloc("a1").unwrap().unwrap();

        assert_eq!(retrieved.id, "a1");
        assert_eq!(retrieved.create_index, index);
        assert_eq!(retrieved.modify_index, index);
        assert_eq!(store.latest_index().unwrap(), index);
    }

    #[test]
    fn alloc_update_keeps_create_index() {
        let store = StateStore::open_in_memory().unwrap();
        let mut alloc = test_alloc("a1", "node-1");
        let first = store.put_alloc(&alloc).unwrap();

        alloc.client_status = ClientStatus::Complete;
        let second = store.put_alloc(&alloc).unwrap();

        let retrieved = store.get_alloc("a1").unwrap().unwrap();
        assert!(second > first);
        assert_eq!(retrieved.create_index, first);
        assert_eq!(retrieved.modify_index, second);
        assert_eq!(retrieved.client_status, ClientStatus::Complete);
    }

    #[test]
    fn alloc_display_messages_are_not_persisted() {
        let store = StateStore::open_in_memory().unwrap();
        let mut alloc = test_alloc("a1", "node-1");
        let mut event = TaskEvent::new(TASK_STARTED, 5);
        event.display_message = "Task started by client".to_string();
        alloc.task_states.insert(
            "server".to_string(),
            TaskState {
                events: vec![event],
                ..Default::default()
            },
        );

        store.put_alloc(&alloc).unwrap();
        let retrieved = store.get_alloc("a1").unwrap().unwrap();
        assert!(retrieved.task_states["server"].events[0].display_message.is_empty());
    }

    #[test]
    fn alloc_list_by_prefix_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_alloc(&test_alloc("bbb", "node-1")).unwrap();
        store.put_alloc(&test_alloc("abc", "node-1")).unwrap();
        store.put_alloc(&test_alloc("abd", "node-2")).unwrap();

        let all: Vec<_> = store.list_allocs("").unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(all, vec!["abc", "abd", "bbb"]);

        let ab = store.list_allocs("ab").unwrap();
        assert_eq!(ab.len(), 2);
    }

    #[test]
    fn alloc_list_by_node() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_alloc(&test_alloc("a1", "node-1")).unwrap();
        store.put_alloc(&test_alloc("a2", "node-2")).unwrap();

        let on_node = store.list_allocs_by_node("node-2").unwrap();
        assert_eq!(on_node.len(), 1);
        assert_eq!(on_node[0].id, "a2");
    }

    #[test]
    fn alloc_stop_sets_desired_status() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_alloc(&test_alloc("a1", "node-1")).unwrap();

        let index = store.stop_alloc("a1", "eval-stop", 2000).unwrap();
        let alloc = store.get_alloc("a1").unwrap().unwrap();

        assert_eq!(alloc.desired_status, DesiredStatus::Stop);
        assert_eq!(alloc.desired_description, ALLOC_STOPPED_DESCRIPTION);
        assert_eq!(alloc.eval_id, "eval-stop");
        assert_eq!(alloc.modify_index, index);
        assert_eq!(alloc.modify_time, 2000);
    }

    #[test]
    fn alloc_stop_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.stop_alloc("nope", "eval", 1).unwrap_err();
        assert!(matches!(err, StateError::AllocNotFound(id) if id == "nope"));
        assert_eq!(store.latest_index().unwrap(), 0);
    }

    #[test]
    fn client_update_keeps_server_fields() {
        let store = StateStore::open_in_memory().unwrap();
        let mut alloc = test_alloc("a1", "node1");
        alloc.desired_status = DesiredStatus::Stop;
        store.put_alloc(&alloc).unwrap();

        let mut report = test_alloc("a1", "node1");
        report.client_status = ClientStatus::Complete;
        report.desired_status = DesiredStatus::Run;
        let index = store.update_alloc_client_state(&report).unwrap();

        let stored = store.get_alloc("a1").unwrap().unwrap();
        assert_eq!(index, Some(stored.modify_index));
        assert_eq!(stored.client_status, ClientStatus::Complete);
        assert_eq!(stored.desired_status, DesiredStatus::Stop);

        assert!(store.update_alloc_client_state(&test_alloc("zz", "node1")).unwrap().is_none());
    }

    #[test]
    fn alloc_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_alloc(&test_alloc("a1", "node-1")).unwrap();

        assert!(store.delete_alloc("a1").unwrap());
        assert!(!store.delete_alloc("a1").unwrap());
        assert!(store.get_alloc("a1").unwrap().is_none());
    }

    #[test]
    fn alloc_task_names_from_group() {
        let alloc = test_alloc("a1", "node-1");
        assert_eq!(alloc.task_names(), vec!["server".to_string()]);
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("node-1");

        store.put_node(&node).unwrap();
        let retrieved = store.get_node("node-1").unwrap();

        assert_eq!(retrieved, Some(node));
    }

    #[test]
    fn node_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        store.put_node(&test_node("node-2")).unwrap();
        assert_eq!(store.list_nodes().unwrap().len(), 2);

        assert!(store.delete_node("node-1").unwrap());
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_alloc(&test_alloc("a1", "node-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_alloc("a1").unwrap().is_some());
        assert_eq!(store.latest_index().unwrap(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_allocs("").unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(!store.delete_alloc("nope").unwrap());
        assert!(!store.delete_node("nope").unwrap());
        assert_eq!(store.latest_index().unwrap(), 0);
    }
}

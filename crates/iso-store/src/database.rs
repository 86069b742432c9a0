use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::{env, fmt};

use iso_core::time::now_unix_secs;
use iso_core::{
    CancelToken, CompiledQuery, Compiler, EngineConfig, FilterState, Graph, History, MergeOutcome,
    QueryResult, Value, ValueId, execute,
};

use crate::config::{CONFIG_FILE, load_config};
use crate::error::{Result, StoreError};
use crate::store::{Store, StoreStats};

pub const DATABASE_FILE: &str = "isometry.db";

/// Default base directory for all Isometry storage.
pub fn default_data_dir() -> PathBuf {
    home_dir().join(".isometry")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Durable store, the live graph and the filter-state history behind one
/// handle.
///
/// Layout:
/// ```text
/// ~/.isometry/
/// ├── isometry.db
/// └── iso.toml
/// ```
///
/// Writes are serialized through the store lock and publish a new graph
/// version only after the durable write committed. Readers take an
/// `Arc<Graph>` snapshot and never observe later writes. History has its
/// own lock and never touches the live graph.
pub struct Database {
    store: Mutex<Store>,
    graph: RwLock<Arc<Graph>>,
    history: Mutex<History>,
    config: EngineConfig,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            StoreError::InvalidData(format!("failed to create {}: {e}", dir.display()))
        })?;
        let config = load_config(&dir.join(CONFIG_FILE))?;
        let store = Store::open(&dir.join(DATABASE_FILE))?;
        tracing::info!("opened database in {}", dir.display());
        Self::with_store(store, config)
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Self::with_store(Store::open_in_memory()?, config)
    }

    fn with_store(store: Store, config: EngineConfig) -> Result<Self> {
        let graph = store.load_graph()?;
        let history = store.load_history()?;
        Ok(Self {
            store: Mutex::new(store),
            graph: RwLock::new(Arc::new(graph)),
            history: Mutex::new(history),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Immutable view of the graph as of the last committed write.
    pub fn snapshot(&self) -> Arc<Graph> {
        Arc::clone(&*self.graph.read().unwrap_or_else(PoisonError::into_inner))
    }

    // --- Writes ---

    pub fn put(&self, value: Value) -> Result<ValueId> {
        let store = self.lock_store();
        let stored = store.put_value_at(value, now_unix_secs())?;
        let id = stored.id.clone();
        self.publish(|graph| graph.restore(stored).map(|_| ()))?;
        Ok(id)
    }

    pub fn put_batch(&self, values: Vec<Value>) -> Result<Vec<ValueId>> {
        let store = self.lock_store();
        let stored = store.put_batch(values, now_unix_secs())?;
        self.publish_batch(stored)
    }

    pub fn import_values_file(&self, path: &Path) -> Result<Vec<ValueId>> {
        let store = self.lock_store();
        let stored = store.import_values_file(path, now_unix_secs())?;
        let ids = self.publish_batch(stored)?;
        tracing::info!("imported {} values from {}", ids.len(), path.display());
        Ok(ids)
    }

    pub fn delete(&self, id: &ValueId, cascade: bool) -> Result<Vec<ValueId>> {
        let store = self.lock_store();
        let removed = store.delete_value(id, cascade)?;
        self.publish(|graph| graph.delete(id, cascade).map(|_| ()))?;
        Ok(removed)
    }

    /// Apply a committed change to the live graph. Readers holding an older
    /// snapshot keep it; the graph is copied only while one is held.
    fn publish<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Graph) -> iso_core::Result<()>,
    {
        let mut guard = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        apply(Arc::make_mut(&mut *guard))?;
        Ok(())
    }

    /// Publish a committed batch; callers still hold the store lock.
    fn publish_batch(&self, stored: Vec<Value>) -> Result<Vec<ValueId>> {
        let ids = stored.iter().map(|v| v.id.clone()).collect();
        self.publish(|graph| {
            for value in stored {
                graph.restore(value)?;
            }
            Ok(())
        })?;
        Ok(ids)
    }

    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Reads ---

    pub fn get(&self, id: &ValueId) -> Result<Value> {
        Ok(self.snapshot().get(id)?.clone())
    }

    pub fn compile(&self, state: &FilterState) -> Result<CompiledQuery> {
        Ok(Compiler::new(&self.config).compile(state)?)
    }

    /// Compile and run `state` against the current snapshot.
    pub fn query(
        &self,
        state: &FilterState,
        cancel: Option<&CancelToken>,
    ) -> Result<(CompiledQuery, QueryResult)> {
        let compiled = self.compile(state)?;
        let graph = self.snapshot();
        let result = execute(&graph, &compiled.plan, cancel)?;
        if result.truncated {
            tracing::warn!(
                "query truncated at visit budget {}",
                self.config.traversal.visit_budget
            );
        }
        Ok((compiled, result))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.lock_store().stats()
    }

    pub fn db_size(&self) -> u64 {
        self.lock_store().db_size()
    }

    /// Every stored value as a `{"values": [...]}` document.
    pub fn export_values_string(&self) -> Result<String> {
        self.lock_store().export_values_string()
    }

    // --- History ---

    /// Run `f` against the history and persist the result if it succeeds.
    pub fn with_history<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut History) -> iso_core::Result<T>,
    {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut draft = history.clone();
        let out = f(&mut draft)?;
        self.lock_store().save_history(&draft)?;
        *history = draft;
        Ok(out)
    }

    /// A copy of the history for read-only use.
    pub fn history(&self) -> History {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn capture(&self, state: FilterState, label: Option<String>) -> Result<u64> {
        let index = self.with_history(|h| Ok(h.capture(state, label)))?;
        tracing::debug!("captured snapshot #{index}");
        Ok(index)
    }

    pub fn branch(&self, name: &str) -> Result<()> {
        self.with_history(|h| h.branch(name))?;
        tracing::info!("created branch {name}");
        Ok(())
    }

    pub fn checkout(&self, name: &str) -> Result<()> {
        self.with_history(|h| h.checkout(name))
    }

    pub fn merge(&self, name: &str) -> Result<MergeOutcome> {
        let outcome = self.with_history(|h| h.merge(name))?;
        match &outcome {
            MergeOutcome::FastForward { into, transferred } => {
                tracing::info!(
                    "fast-forwarded {name} into {into} ({} snapshots)",
                    transferred.len()
                );
            }
            MergeOutcome::Conflict(conflict) => {
                tracing::warn!(
                    "merge of {name} conflicts: parent moved by {} snapshots",
                    conflict.parent_snapshots.len()
                );
            }
        }
        Ok(outcome)
    }

    pub fn export_history_file(&self, path: &Path) -> Result<()> {
        let _history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        self.lock_store().export_history_file(path)
    }

    /// Replace the history with a wire document; returns the snapshot count.
    pub fn import_history_file(&self, path: &Path) -> Result<usize> {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let store = self.lock_store();
        store.import_history_file(path)?;
        *history = store.load_history()?;
        let count = history.snapshots().count();
        tracing::info!("imported {count} snapshots from {}", path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use iso_core::{Axis, AxisFilter, Condition, IsoError, MAIN_BRANCH, Population};

    fn scenario(db: &Database) {
        db.put_batch(vec![
            Value::node("alice"),
            Value::node("bob"),
            Value::node("carol"),
            Value::edge("ab", "alice", "bob")
                .with_axis_attr("channel", Axis::Categorical, "email"),
            Value::edge("bc", "bob", "carol").with_axis_attr("channel", Axis::Categorical, "chat"),
        ])
        .unwrap();
    }

    fn email_only() -> FilterState {
        FilterState::new().with(
            Axis::Categorical,
            AxisFilter::all(vec![Condition::equals("channel", "email")]),
        )
    }

    #[test]
    fn test_open_creates_layout_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            scenario(&db);
            db.capture(email_only(), Some("email".into())).unwrap();
        }
        assert!(dir.path().join(DATABASE_FILE).exists());

        let db = Database::open(dir.path()).unwrap();
        let graph = db.snapshot();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        let history = db.history();
        assert_eq!(history.lineage(MAIN_BRANCH).unwrap().len(), 1);
    }

    #[test]
    fn test_config_is_read_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[replay]\ninterval_ms = 20\n").unwrap();
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.config().replay.interval_ms, 20);
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        scenario(&db);

        let before = db.snapshot();
        db.put(Value::node("dave")).unwrap();
        db.delete(&"bob".into(), true).unwrap();

        assert_eq!(before.node_count(), 3);
        assert!(before.contains(&"bob".into()));
        let after = db.snapshot();
        assert_eq!(after.node_count(), 3);
        assert!(!after.contains(&"bob".into()));
        assert!(after.contains(&"dave".into()));
    }

    #[test]
    fn test_failed_write_changes_nothing() {
        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        scenario(&db);

        let err = db.put(Value::edge("bx", "bob", "xavier")).unwrap_err();
        assert!(matches!(
            err.as_core(),
            Some(IsoError::ReferentialIntegrity { .. })
        ));
        assert!(!db.snapshot().contains(&"bx".into()));
        assert_eq!(db.stats().unwrap().edges, 2);
    }

    #[test]
    fn test_query_uses_live_graph() {
        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        scenario(&db);

        let (compiled, result) = db.query(&email_only(), None).unwrap();
        assert!(compiled.text.contains("categorical.channel"));
        let ids: Vec<&str> = result.ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["ab"]);
    }

    #[test]
    fn test_history_persists_through_store() {
        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        db.capture(FilterState::new(), None).unwrap();
        db.branch("nodes-only").unwrap();
        db.capture(FilterState::new().population(Population::Nodes), None)
            .unwrap();
        assert!(matches!(
            db.merge("nodes-only").unwrap(),
            MergeOutcome::FastForward { .. }
        ));

        let stored = db.lock_store().load_history().unwrap();
        assert_eq!(stored.current(), MAIN_BRANCH);
        assert_eq!(stored.lineage(MAIN_BRANCH).unwrap().len(), 2);
    }

    #[test]
    fn test_import_values_file_publishes_to_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");
        fs::write(
            &path,
            r#"[{"id": "ab", "kind": "edge", "link": {"source": "a", "target": "b"}},
                {"id": "a", "kind": "node"}, {"id": "b", "kind": "node"}]"#,
        )
        .unwrap();

        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        let ids = db.import_values_file(&path).unwrap();
        let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "ab"]);
        assert_eq!(db.snapshot().edge_count(), 1);

        let exported: serde_json::Value =
            serde_json::from_str(&db.export_values_string().unwrap()).unwrap();
        assert_eq!(exported["values"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_history_file_replaces_live_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let source = Database::open_in_memory(EngineConfig::default()).unwrap();
        source.capture(FilterState::new(), Some("all".into())).unwrap();
        source.branch("email").unwrap();
        source.capture(email_only(), None).unwrap();
        source.export_history_file(&path).unwrap();

        let target = Database::open_in_memory(EngineConfig::default()).unwrap();
        target.capture(FilterState::new(), None).unwrap();
        assert_eq!(target.import_history_file(&path).unwrap(), 2);

        let history = target.history();
        assert_eq!(history.current(), "email");
        assert_eq!(history.lineage("email").unwrap().len(), 2);
        let stored = target.lock_store().load_history().unwrap();
        assert_eq!(stored.lineage("email").unwrap(), history.lineage("email").unwrap());
    }

    #[test]
    fn test_failed_history_op_leaves_history_untouched() {
        let db = Database::open_in_memory(EngineConfig::default()).unwrap();
        db.branch("dup").unwrap();
        assert!(db.branch("dup").is_err());
        assert!(db.checkout("missing").is_err());
        assert_eq!(db.history().current(), "dup");
    }

    #[test]
    fn test_readers_run_alongside_writer() {
        let db = Arc::new(Database::open_in_memory(EngineConfig::default()).unwrap());
        scenario(&db);
        let barrier = Arc::new(Barrier::new(3));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let db = Arc::clone(&db);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let graph = db.snapshot();
                        // Every published version keeps its edges attached.
                        for edge in graph.edges() {
                            let link = edge.link.as_ref().unwrap();
                            assert!(graph.contains(&link.source));
                            assert!(graph.contains(&link.target));
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        for i in 0..50 {
            let id = format!("n{i}");
            db.put(Value::node(id.as_str())).unwrap();
            db.put(Value::edge(format!("e{i}"), "alice", id.as_str()))
                .unwrap();
        }
        db.delete(&"alice".into(), true).unwrap();

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(db.snapshot().edge_count(), 1);
    }
}

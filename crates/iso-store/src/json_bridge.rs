use std::fs;
use std::path::Path;

use serde::Serialize;

use iso_core::{Value, export_history, import_history, parse_values};

use crate::error::{Result, StoreError};
use crate::store::Store;

#[derive(Serialize)]
struct ValueExport<'a> {
    values: &'a [Value],
}

impl Store {
    /// Import a JSON batch of values (bare array or `{"values": [...]}`).
    /// The batch is atomic; the stored values come back nodes first.
    pub fn import_values_file(&self, path: &Path, now: i64) -> Result<Vec<Value>> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_values_str(&json, now)
    }

    pub fn import_values_str(&self, json: &str, now: i64) -> Result<Vec<Value>> {
        let values =
            parse_values(json).map_err(|e| StoreError::InvalidData(format!("invalid JSON: {e}")))?;
        self.put_batch(values, now)
    }

    /// Every stored value as `{"values": [...]}`, nodes first.
    pub fn export_values_string(&self) -> Result<String> {
        let values = self.all_values()?;
        serde_json::to_string_pretty(&ValueExport { values: &values })
            .map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))
    }

    /// Export the persisted history as a versioned wire document.
    pub fn export_history_file(&self, path: &Path) -> Result<()> {
        let history = self.load_history()?;
        let json = export_history(&history)
            .map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Replace the persisted history with a wire document.
    pub fn import_history_file(&self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        let history = import_history(&json)?;
        self.save_history(&history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iso_core::{FilterState, MAIN_BRANCH, Population};

    const SCENARIO: &str = r#"{
        "values": [
            {"id": "ab", "kind": "edge", "link": {"source": "alice", "target": "bob"},
             "attributes": {
                "channel": {"value": "email", "axis": "categorical"},
                "sent": {"value": "2024-01-01", "axis": "temporal"}
             }},
            {"id": "alice", "kind": "node", "attributes": {"name": {"value": "alice"}}},
            {"id": "bob", "kind": "node"}
        ]
    }"#;

    #[test]
    fn test_import_values_in_any_order() {
        let store = Store::open_in_memory().unwrap();
        let stored = store.import_values_str(SCENARIO, 10).unwrap();
        assert!(stored.iter().all(|v| v.modified_at == 10));
        let ids: Vec<&str> = stored.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob", "ab"]);

        let facets = store.get_facets(&"ab".into()).unwrap();
        assert_eq!(facets.len(), 2);
    }

    #[test]
    fn test_export_then_import_into_fresh_store() {
        let store = Store::open_in_memory().unwrap();
        store.import_values_str(SCENARIO, 10).unwrap();
        let exported = store.export_values_string().unwrap();

        let wire: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(wire["values"].as_array().unwrap().len(), 3);

        let fresh = Store::open_in_memory().unwrap();
        fresh.import_values_str(&exported, 20).unwrap();
        // modified_at is restamped on import; everything else carries over.
        let strip = |values: Vec<Value>| -> Vec<Value> {
            values
                .into_iter()
                .map(|v| Value { modified_at: 0, ..v })
                .collect()
        };
        assert_eq!(
            strip(fresh.all_values().unwrap()),
            strip(store.all_values().unwrap())
        );
    }

    #[test]
    fn test_import_invalid_json() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.import_values_str("not valid json", 10),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn test_dangling_edge_rejects_whole_batch() {
        let store = Store::open_in_memory().unwrap();
        let json = r#"[
            {"id": "a", "kind": "node"},
            {"id": "ax", "kind": "edge", "link": {"source": "a", "target": "x"}}
        ]"#;
        assert!(store.import_values_str(json, 10).is_err());
        assert_eq!(store.stats().unwrap().nodes, 0);
    }

    #[test]
    fn test_history_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let store = Store::open_in_memory().unwrap();
        let mut history = iso_core::History::new();
        history.capture_at(FilterState::new().population(Population::Edges), None, 5);
        history.branch("alt").unwrap();
        history.capture_at(FilterState::new(), Some("wide".into()), 6);
        store.save_history(&history).unwrap();
        store.export_history_file(&path).unwrap();

        let wire: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(wire["version"], iso_core::CURRENT_VERSION);
        assert_eq!(wire["currentBranch"], "alt");

        let other = Store::open_in_memory().unwrap();
        other.import_history_file(&path).unwrap();
        let loaded = other.load_history().unwrap();
        assert_eq!(loaded.lineage("alt").unwrap(), history.lineage("alt").unwrap());
        assert_eq!(loaded.lineage(MAIN_BRANCH).unwrap().len(), 1);
    }
}

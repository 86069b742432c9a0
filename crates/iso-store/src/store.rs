use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use iso_core::time::now_unix_secs;
use iso_core::{
    Attribute, Axis, Branch, Facet, FacetValue, Graph, History, IsoError, Link, Snapshot, Value,
    ValueId, ValueKind, derive_facets,
};

use crate::error::{Result, StoreError};
use crate::schema;

const CURRENT_BRANCH_KEY: &str = "current_branch";

/// Counts reported by `Store::stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub nodes: u64,
    pub edges: u64,
    pub facets: u64,
    pub branches: u64,
    pub snapshots: u64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    // --- Values ---

    /// Insert or update one value; returns its id.
    pub fn put_value(&self, value: Value) -> Result<ValueId> {
        self.put_value_at(value, now_unix_secs()).map(|v| v.id)
    }

    /// Insert or update one value with an explicit clock; returns the value
    /// exactly as stored (timestamps stamped).
    ///
    /// The kind check, endpoint check, facet derivation and row rewrite
    /// share one transaction, so a failure leaves the store untouched.
    pub fn put_value_at(&self, value: Value, now: i64) -> Result<Value> {
        let tx = self.conn.unchecked_transaction()?;
        let stored = put_on(&tx, value, now)?;
        tx.commit()?;
        tracing::debug!("stored {} {}", stored.kind, stored.id);
        Ok(stored)
    }

    /// Store a whole batch atomically: either every value lands or none.
    /// Nodes are written before edges so a batch may carry both ends.
    pub fn put_batch(&self, values: Vec<Value>, now: i64) -> Result<Vec<Value>> {
        let (nodes, edges): (Vec<Value>, Vec<Value>) =
            values.into_iter().partition(|v| v.kind == ValueKind::Node);

        let tx = self.conn.unchecked_transaction()?;
        let mut stored = Vec::with_capacity(nodes.len() + edges.len());
        for value in nodes.into_iter().chain(edges) {
            stored.push(put_on(&tx, value, now)?);
        }
        tx.commit()?;
        tracing::info!("stored batch of {} values", stored.len());
        Ok(stored)
    }

    pub fn get_value(&self, id: &ValueId) -> Result<Value> {
        let row = self
            .conn
            .query_row(
                "SELECT v.kind, v.created_at, v.modified_at, v.attributes,
                        e.source_id, e.target_id, e.directed
                 FROM vals v LEFT JOIN edges e ON e.value_id = v.id
                 WHERE v.id = ?1",
                [id.as_str()],
                |row| {
                    Ok(ValueRow {
                        id: id.as_str().to_string(),
                        kind: row.get(0)?,
                        created_at: row.get(1)?,
                        modified_at: row.get(2)?,
                        attributes: row.get(3)?,
                        source: row.get(4)?,
                        target: row.get(5)?,
                        directed: row.get(6)?,
                    })
                },
            )
            .optional()?;
        match row {
            Some(row) => row.into_value(),
            None => Err(IsoError::NotFound(id.clone()).into()),
        }
    }

    /// Facet rows of one value, in derivation order.
    pub fn get_facets(&self, id: &ValueId) -> Result<Vec<Facet>> {
        if !self.contains(id)? {
            return Err(IsoError::NotFound(id.clone()).into());
        }
        let mut stmt = self.conn.prepare(
            "SELECT axis, name, value FROM facets WHERE value_id = ?1 ORDER BY rowid",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([id.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(axis, name, value)| {
                Ok(Facet {
                    value_id: id.clone(),
                    axis: parse_axis(&axis)?,
                    name,
                    value: parse_json::<FacetValue>(&value, "facet value")?,
                })
            })
            .collect()
    }

    pub fn contains(&self, id: &ValueId) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM vals WHERE id = ?1", [id.as_str()], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Delete a value; a node with incident edges needs `cascade`.
    /// Returns every removed id, edges first.
    pub fn delete_value(&self, id: &ValueId, cascade: bool) -> Result<Vec<ValueId>> {
        let tx = self.conn.unchecked_transaction()?;
        let kind: Option<String> = tx
            .query_row("SELECT kind FROM vals WHERE id = ?1", [id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(kind) = kind else {
            return Err(IsoError::NotFound(id.clone()).into());
        };

        let mut removed = Vec::new();
        if parse_kind(&kind)? == ValueKind::Node {
            let dependents = incident_edges_on(&tx, id)?;
            if !dependents.is_empty() && !cascade {
                return Err(IsoError::DependentEdges {
                    node: id.clone(),
                    edges: dependents,
                }
                .into());
            }
            for edge in dependents {
                tx.execute("DELETE FROM vals WHERE id = ?1", [edge.as_str()])?;
                removed.push(edge);
            }
        }
        tx.execute("DELETE FROM vals WHERE id = ?1", [id.as_str()])?;
        removed.push(id.clone());
        tx.commit()?;

        if removed.len() > 1 {
            tracing::info!("cascade delete of {id} removed {} edges", removed.len() - 1);
        }
        Ok(removed)
    }

    /// Every stored value, nodes first, each group in id order.
    pub fn all_values(&self) -> Result<Vec<Value>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.id, v.kind, v.created_at, v.modified_at, v.attributes,
                    e.source_id, e.target_id, e.directed
             FROM vals v LEFT JOIN edges e ON e.value_id = v.id
             ORDER BY CASE v.kind WHEN 'node' THEN 0 ELSE 1 END, v.id",
        )?;
        let rows: Vec<ValueRow> = stmt
            .query_map([], |row| {
                Ok(ValueRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    created_at: row.get(2)?,
                    modified_at: row.get(3)?,
                    attributes: row.get(4)?,
                    source: row.get(5)?,
                    target: row.get(6)?,
                    directed: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(ValueRow::into_value).collect()
    }

    /// Rebuild the in-memory graph from durable rows.
    pub fn load_graph(&self) -> Result<Graph> {
        let mut graph = Graph::new();
        for value in self.all_values()? {
            graph.restore(value)?;
        }
        tracing::debug!(
            "loaded graph: {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(graph)
    }

    // --- History ---

    /// Replace the persisted history with `history`.
    pub fn save_history(&self, history: &History) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM snapshots; DELETE FROM branches;")?;

        for branch in history.branches() {
            tx.execute(
                "INSERT INTO branches (name, parent, base) VALUES (?1, ?2, ?3)",
                params![branch.name, branch.parent, branch.base as i64],
            )?;
        }
        {
            let mut insert = tx.prepare(
                "INSERT INTO snapshots (idx, branch, position, captured_at, label, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for branch in history.branches() {
                for (position, index) in branch.snapshots.iter().enumerate() {
                    let Some(snapshot) = history.snapshot(*index) else {
                        return Err(StoreError::InvalidData(format!(
                            "branch {} lists missing snapshot #{index}",
                            branch.name
                        )));
                    };
                    let state = serde_json::to_string(&snapshot.state).map_err(|e| {
                        StoreError::InvalidData(format!("snapshot #{index} state: {e}"))
                    })?;
                    insert.execute(params![
                        *index as i64,
                        branch.name,
                        position as i64,
                        snapshot.captured_at,
                        snapshot.label,
                        state,
                    ])?;
                }
            }
        }
        set_metadata_on(&tx, CURRENT_BRANCH_KEY, history.current())?;
        tx.commit()?;

        tracing::debug!(
            "saved history: {} branches, {} snapshots",
            history.branches().count(),
            history.snapshots().count()
        );
        Ok(())
    }

    /// Load the persisted history; a store that never saved one yields a
    /// fresh history with only the main branch.
    pub fn load_history(&self) -> Result<History> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, parent, base FROM branches ORDER BY name")?;
        let mut branches: BTreeMap<String, Branch> = stmt
            .query_map([], |row| {
                Ok(Branch {
                    name: row.get(0)?,
                    parent: row.get(1)?,
                    base: row.get::<_, i64>(2)? as usize,
                    snapshots: Vec::new(),
                })
            })?
            .map(|r| r.map(|b| (b.name.clone(), b)))
            .collect::<std::result::Result<_, _>>()?;

        if branches.is_empty() {
            return Ok(History::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT idx, branch, captured_at, label, state
             FROM snapshots ORDER BY branch, position",
        )?;
        let rows: Vec<(i64, String, i64, Option<String>, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for (index, branch, captured_at, label, state) in rows {
            let index = index as u64;
            let owner = branches.get_mut(&branch).ok_or_else(|| {
                StoreError::InvalidData(format!("snapshot #{index} on unknown branch {branch}"))
            })?;
            owner.snapshots.push(index);
            snapshots.push(Snapshot {
                index,
                branch,
                captured_at,
                label,
                state: parse_json(&state, "snapshot state")?,
            });
        }

        let current = self
            .get_metadata(CURRENT_BRANCH_KEY)?
            .unwrap_or_else(|| iso_core::MAIN_BRANCH.to_string());
        Ok(History::from_parts(
            branches.into_values().collect(),
            snapshots,
            current,
        )?)
    }

    // --- Stats ---

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            nodes: count("SELECT COUNT(*) FROM vals WHERE kind = 'node'")?,
            edges: count("SELECT COUNT(*) FROM vals WHERE kind = 'edge'")?,
            facets: count("SELECT COUNT(*) FROM facets")?,
            branches: count("SELECT COUNT(*) FROM branches")?,
            snapshots: count("SELECT COUNT(*) FROM snapshots")?,
        })
    }

    /// Database file size in bytes (page_count * page_size).
    pub fn db_size(&self) -> u64 {
        self.conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .unwrap_or(0)
    }
}

struct ValueRow {
    id: String,
    kind: String,
    created_at: i64,
    modified_at: i64,
    attributes: String,
    source: Option<String>,
    target: Option<String>,
    directed: Option<bool>,
}

impl ValueRow {
    fn into_value(self) -> Result<Value> {
        let kind = parse_kind(&self.kind)?;
        let link = match (kind, self.source, self.target) {
            (ValueKind::Edge, Some(source), Some(target)) => Some(Link {
                source: ValueId::new(source),
                target: ValueId::new(target),
                directed: self.directed.unwrap_or(true),
            }),
            (ValueKind::Edge, _, _) => {
                return Err(StoreError::InvalidData(format!(
                    "edge {} has no endpoint row",
                    self.id
                )));
            }
            (ValueKind::Node, _, _) => None,
        };
        Ok(Value {
            id: ValueId::new(self.id),
            kind,
            link,
            created_at: self.created_at,
            modified_at: self.modified_at,
            attributes: parse_json::<BTreeMap<String, Attribute>>(&self.attributes, "attributes")?,
        })
    }
}

/// The transactional body of a put. Mirrors `Graph::check` against rows.
fn put_on(conn: &Connection, mut value: Value, now: i64) -> Result<Value> {
    value.validate()?;

    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT kind, created_at FROM vals WHERE id = ?1",
            [value.id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match existing {
        Some((kind, created_at)) => {
            let existing = parse_kind(&kind)?;
            if existing != value.kind {
                return Err(IsoError::KindChanged {
                    id: value.id.clone(),
                    existing,
                    attempted: value.kind,
                }
                .into());
            }
            value.created_at = created_at;
        }
        None if value.created_at == 0 => value.created_at = now,
        None => {}
    }
    value.modified_at = now.max(value.created_at);

    if let Some(link) = &value.link {
        for endpoint in [&link.source, &link.target] {
            let kind: Option<String> = conn
                .query_row(
                    "SELECT kind FROM vals WHERE id = ?1",
                    [endpoint.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let reason = match kind.as_deref() {
                None => "no such node",
                Some("node") => continue,
                Some(_) => "endpoint is an edge, not a node",
            };
            return Err(IsoError::ReferentialIntegrity {
                edge: value.id.clone(),
                endpoint: endpoint.clone(),
                reason: reason.to_string(),
            }
            .into());
        }
    }

    let facets = derive_facets(&value)?;
    let attributes = serde_json::to_string(&value.attributes)
        .map_err(|e| StoreError::InvalidData(format!("attributes of {}: {e}", value.id)))?;

    conn.execute(
        "INSERT INTO vals (id, kind, created_at, modified_at, attributes)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             modified_at = excluded.modified_at,
             attributes  = excluded.attributes",
        params![
            value.id.as_str(),
            value.kind.as_str(),
            value.created_at,
            value.modified_at,
            attributes,
        ],
    )?;

    if let Some(link) = &value.link {
        conn.execute(
            "INSERT INTO edges (value_id, source_id, target_id, directed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(value_id) DO UPDATE SET
                 source_id = excluded.source_id,
                 target_id = excluded.target_id,
                 directed  = excluded.directed",
            params![
                value.id.as_str(),
                link.source.as_str(),
                link.target.as_str(),
                link.directed,
            ],
        )?;
    }

    conn.execute("DELETE FROM facets WHERE value_id = ?1", [value.id.as_str()])?;
    let mut insert =
        conn.prepare("INSERT INTO facets (value_id, axis, name, value) VALUES (?1, ?2, ?3, ?4)")?;
    for facet in &facets {
        let encoded = serde_json::to_string(&facet.value)
            .map_err(|e| StoreError::InvalidData(format!("facet of {}: {e}", value.id)))?;
        insert.execute(params![
            value.id.as_str(),
            facet.axis.as_str(),
            facet.name,
            encoded,
        ])?;
    }

    Ok(value)
}

fn incident_edges_on(conn: &Connection, node: &ValueId) -> Result<Vec<ValueId>> {
    let mut stmt = conn.prepare(
        "SELECT value_id FROM edges WHERE source_id = ?1 OR target_id = ?1 ORDER BY value_id",
    )?;
    let ids = stmt
        .query_map([node.as_str()], |row| row.get::<_, String>(0))?
        .map(|r| r.map(ValueId::new))
        .collect::<std::result::Result<_, _>>()?;
    Ok(ids)
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn parse_kind(s: &str) -> Result<ValueKind> {
    s.parse().map_err(StoreError::InvalidData)
}

fn parse_axis(s: &str) -> Result<Axis> {
    s.parse()
        .map_err(|e| StoreError::InvalidData(format!("facet axis: {e}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| StoreError::InvalidData(format!("invalid {what}: {e}")))
}

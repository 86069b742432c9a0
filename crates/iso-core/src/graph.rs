//! In-memory value store with its facet index and adjacency.
//!
//! A `Graph` is a plain value: cloning it yields an independent snapshot.
//! Persistence layers keep it behind an `Arc` and publish a new one after
//! each committed write, which is how queries get snapshot isolation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{IsoError, Result};
use crate::facet::{Facet, FacetValue, derive_facets};
use crate::time::now_unix_secs;
use crate::value::{Axis, Value, ValueId, ValueKind};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FacetKey {
    pub axis: Axis,
    pub name: String,
}

impl FacetKey {
    pub fn new(axis: Axis, name: impl Into<String>) -> Self {
        Self {
            axis,
            name: name.into(),
        }
    }
}

/// Postings for one facet key: facet value → ids carrying it.
pub type Postings = BTreeMap<FacetValue, BTreeSet<ValueId>>;

/// Secondary index of facets, by value and by `(axis, name)`.
#[derive(Clone, Debug, Default)]
pub struct FacetIndex {
    by_value: HashMap<ValueId, Vec<Facet>>,
    by_key: BTreeMap<FacetKey, Postings>,
    len: usize,
}

impl FacetIndex {
    /// Replace every facet row of `id`.
    fn replace(&mut self, id: &ValueId, facets: Vec<Facet>) {
        self.remove(id);
        for facet in &facets {
            self.by_key
                .entry(FacetKey::new(facet.axis, facet.name.clone()))
                .or_default()
                .entry(facet.value.clone())
                .or_default()
                .insert(id.clone());
        }
        self.len += facets.len();
        self.by_value.insert(id.clone(), facets);
    }

    fn remove(&mut self, id: &ValueId) {
        let Some(old) = self.by_value.remove(id) else {
            return;
        };
        self.len -= old.len();
        for facet in old {
            let key = FacetKey::new(facet.axis, facet.name);
            if let Some(postings) = self.by_key.get_mut(&key) {
                if let Some(ids) = postings.get_mut(&facet.value) {
                    ids.remove(id);
                    if ids.is_empty() {
                        postings.remove(&facet.value);
                    }
                }
                if postings.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    pub fn facets_of(&self, id: &ValueId) -> &[Facet] {
        self.by_value.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Facet values of `id` under one key, in facet order.
    pub fn values_of<'a>(
        &'a self,
        id: &ValueId,
        axis: Axis,
        name: &'a str,
    ) -> impl Iterator<Item = &'a FacetValue> + 'a {
        self.facets_of(id)
            .iter()
            .filter(move |f| f.axis == axis && f.name == name)
            .map(|f| &f.value)
    }

    pub fn postings(&self, key: &FacetKey) -> Option<&Postings> {
        self.by_key.get(key)
    }

    /// All keys (and their postings) on one axis.
    pub fn keys_on(&self, axis: Axis) -> impl Iterator<Item = (&FacetKey, &Postings)> {
        self.by_key.iter().filter(move |(k, _)| k.axis == axis)
    }

    pub fn keys(&self) -> impl Iterator<Item = &FacetKey> {
        self.by_key.keys()
    }

    /// Total facet rows.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Nodes, edges, their facets and incidence lists.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    values: BTreeMap<ValueId, Value>,
    facets: FacetIndex,
    outgoing: HashMap<ValueId, BTreeSet<ValueId>>,
    incoming: HashMap<ValueId, BTreeSet<ValueId>>,
    edge_count: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update, stamping timestamps with the current time.
    pub fn put(&mut self, value: Value) -> Result<ValueId> {
        self.put_at(value, now_unix_secs())
    }

    /// Insert or update with an explicit clock.
    ///
    /// `created_at` survives updates; `modified_at` becomes `now`. Nothing is
    /// mutated unless every check and the facet derivation succeed.
    pub fn put_at(&mut self, mut value: Value, now: i64) -> Result<ValueId> {
        match self.values.get(&value.id) {
            Some(existing) => value.created_at = existing.created_at,
            None if value.created_at == 0 => value.created_at = now,
            None => {}
        }
        value.modified_at = now.max(value.created_at);
        self.insert_checked(value)
    }

    /// Insert a value exactly as given (timestamps untouched). Used when
    /// rebuilding from durable storage.
    pub fn restore(&mut self, value: Value) -> Result<ValueId> {
        self.insert_checked(value)
    }

    /// Validate a candidate write without applying it; returns its facets.
    pub fn check(&self, value: &Value) -> Result<Vec<Facet>> {
        value.validate()?;
        if let Some(existing) = self.values.get(&value.id)
            && existing.kind != value.kind
        {
            return Err(IsoError::KindChanged {
                id: value.id.clone(),
                existing: existing.kind,
                attempted: value.kind,
            });
        }
        if let Some(link) = &value.link {
            for endpoint in [&link.source, &link.target] {
                match self.values.get(endpoint) {
                    None => {
                        return Err(IsoError::ReferentialIntegrity {
                            edge: value.id.clone(),
                            endpoint: endpoint.clone(),
                            reason: "no such node".to_string(),
                        });
                    }
                    Some(v) if v.kind != ValueKind::Node => {
                        return Err(IsoError::ReferentialIntegrity {
                            edge: value.id.clone(),
                            endpoint: endpoint.clone(),
                            reason: "endpoint is an edge, not a node".to_string(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        derive_facets(value)
    }

    fn insert_checked(&mut self, value: Value) -> Result<ValueId> {
        let facets = self.check(&value)?;
        let id = value.id.clone();

        if let Some(old) = self.values.get(&id).and_then(|v| v.link.clone()) {
            self.unlink(&id, &old.source, &old.target);
        }
        if let Some(link) = &value.link {
            self.outgoing
                .entry(link.source.clone())
                .or_default()
                .insert(id.clone());
            self.incoming
                .entry(link.target.clone())
                .or_default()
                .insert(id.clone());
        }

        self.facets.replace(&id, facets);
        if self.values.insert(id.clone(), value).is_none() && self.is_edge(&id) {
            self.edge_count += 1;
        }
        Ok(id)
    }

    fn unlink(&mut self, edge: &ValueId, source: &ValueId, target: &ValueId) {
        if let Some(set) = self.outgoing.get_mut(source) {
            set.remove(edge);
            if set.is_empty() {
                self.outgoing.remove(source);
            }
        }
        if let Some(set) = self.incoming.get_mut(target) {
            set.remove(edge);
            if set.is_empty() {
                self.incoming.remove(target);
            }
        }
    }

    pub fn get(&self, id: &ValueId) -> Result<&Value> {
        self.values
            .get(id)
            .ok_or_else(|| IsoError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &ValueId) -> bool {
        self.values.contains_key(id)
    }

    pub fn kind_of(&self, id: &ValueId) -> Option<ValueKind> {
        self.values.get(id).map(|v| v.kind)
    }

    pub fn is_edge(&self, id: &ValueId) -> bool {
        self.kind_of(id) == Some(ValueKind::Edge)
    }

    /// Edges touching `node`, in id order.
    pub fn incident_edges(&self, node: &ValueId) -> BTreeSet<ValueId> {
        let mut edges = BTreeSet::new();
        if let Some(out) = self.outgoing.get(node) {
            edges.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(node) {
            edges.extend(inc.iter().cloned());
        }
        edges
    }

    pub fn outgoing(&self, node: &ValueId) -> impl Iterator<Item = &ValueId> {
        self.outgoing.get(node).into_iter().flatten()
    }

    pub fn incoming(&self, node: &ValueId) -> impl Iterator<Item = &ValueId> {
        self.incoming.get(node).into_iter().flatten()
    }

    /// Delete a value. A node with incident edges is rejected unless
    /// `cascade`, in which case its edges go first. Returns removed ids.
    pub fn delete(&mut self, id: &ValueId, cascade: bool) -> Result<Vec<ValueId>> {
        let value = self.get(id)?;
        let mut removed = Vec::new();

        if value.kind == ValueKind::Node {
            let dependents: Vec<ValueId> = self.incident_edges(id).into_iter().collect();
            if !dependents.is_empty() && !cascade {
                return Err(IsoError::DependentEdges {
                    node: id.clone(),
                    edges: dependents,
                });
            }
            for edge in dependents {
                self.remove_value(&edge);
                removed.push(edge);
            }
        }

        self.remove_value(id);
        removed.push(id.clone());
        Ok(removed)
    }

    fn remove_value(&mut self, id: &ValueId) {
        let Some(value) = self.values.remove(id) else {
            return;
        };
        if let Some(link) = &value.link {
            self.unlink(id, &link.source, &link.target);
            self.edge_count -= 1;
        }
        self.facets.remove(id);
    }

    pub fn get_facets(&self, id: &ValueId) -> Result<&[Facet]> {
        if !self.contains(id) {
            return Err(IsoError::NotFound(id.clone()));
        }
        Ok(self.facets.facets_of(id))
    }

    pub fn facet_index(&self) -> &FacetIndex {
        &self.facets
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ValueId> {
        self.values.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Value> {
        self.values.values().filter(|v| v.kind == ValueKind::Node)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Value> {
        self.values.values().filter(|v| v.kind == ValueKind::Edge)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.values.len() - self.edge_count
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facet::derive_facets;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn people() -> Graph {
        let mut g = Graph::new();
        for name in ["alice", "bob", "carol"] {
            g.put_at(Value::node(name).with_attr("name", name), 100).unwrap();
        }
        g.put_at(Value::edge("ab", "alice", "bob"), 100).unwrap();
        g
    }

    #[test]
    fn test_put_get_roundtrip() {
        let g = people();
        assert_eq!(g.get(&"alice".into()).unwrap().label(), "alice");
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.edge_count(), 1);
        assert!(matches!(g.get(&"zed".into()), Err(IsoError::NotFound(_))));
    }

    #[test]
    fn test_dangling_edge_rejected_and_store_unchanged() {
        let mut g = people();
        let before = g.len();
        let err = g.put(Value::edge("bx", "bob", "ghost")).unwrap_err();
        match err {
            IsoError::ReferentialIntegrity { edge, endpoint, .. } => {
                assert_eq!(edge.as_str(), "bx");
                assert_eq!(endpoint.as_str(), "ghost");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(g.len(), before);
        assert!(g.get_facets(&"bx".into()).is_err());
    }

    #[test]
    fn test_out_of_range_date_rejected_without_panic() {
        let mut g = people();
        let before = g.len();
        let err = g
            .put(Value::node("n").with_axis_attr("due", Axis::Temporal, "9999999999999999-01-01"))
            .unwrap_err();
        assert!(matches!(err, IsoError::FacetDerivation { .. }), "{err:?}");
        assert_eq!(g.len(), before);
    }

    #[test]
    fn test_edge_cannot_target_edge() {
        let mut g = people();
        let err = g.put(Value::edge("meta", "alice", "ab")).unwrap_err();
        assert!(matches!(err, IsoError::ReferentialIntegrity { .. }));
    }

    #[test]
    fn test_kind_is_immutable() {
        let mut g = people();
        let mut forged = Value::edge("alice", "bob", "carol");
        forged.attributes.clear();
        assert!(matches!(
            g.put(forged),
            Err(IsoError::KindChanged { .. })
        ));
        assert_eq!(g.kind_of(&"alice".into()), Some(ValueKind::Node));
    }

    #[test]
    fn test_update_rederives_facets() {
        let mut g = people();
        g.put(Value::node("alice").with_axis_attr("team", Axis::Categorical, "red"))
            .unwrap();
        let facets = g.get_facets(&"alice".into()).unwrap();
        assert_eq!(facets.len(), 1, "old name facet must be gone");
        assert_eq!(facets[0].name, "team");
        let key = FacetKey::new(Axis::Lexical, "name");
        let names = g.facet_index().postings(&key).unwrap();
        assert!(!names.values().any(|ids| ids.contains(&"alice".into())));
    }

    #[test]
    fn test_failed_derivation_leaves_old_version() {
        let mut g = people();
        let bad = Value::node("alice").with_axis_attr("born", Axis::Temporal, "not a date");
        assert!(g.put(bad).is_err());
        assert_eq!(g.get(&"alice".into()).unwrap().label(), "alice");
        assert_eq!(g.get_facets(&"alice".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_created_at_survives_update() {
        let mut g = Graph::new();
        g.put_at(Value::node("n"), 10).unwrap();
        g.put_at(Value::node("n").with_attr("x", 1.0), 20).unwrap();
        let v = g.get(&"n".into()).unwrap();
        assert_eq!((v.created_at, v.modified_at), (10, 20));
    }

    #[test]
    fn test_edge_endpoint_update_moves_adjacency() {
        let mut g = people();
        g.put(Value::edge("ab", "alice", "carol")).unwrap();
        assert_eq!(g.incoming(&"bob".into()).count(), 0);
        assert_eq!(g.incoming(&"carol".into()).count(), 1);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_delete_rejects_then_cascades() {
        let mut g = people();
        let err = g.delete(&"bob".into(), false).unwrap_err();
        assert!(matches!(err, IsoError::DependentEdges { ref edges, .. } if edges.len() == 1));
        assert!(g.contains(&"bob".into()));

        let removed = g.delete(&"bob".into(), true).unwrap();
        assert_eq!(removed, vec![ValueId::from("ab"), ValueId::from("bob")]);
        assert_eq!(g.edge_count(), 0);
        assert!(g.outgoing(&"alice".into()).next().is_none());
        assert!(g.facet_index().len() > 0);
    }

    #[test]
    fn test_facets_match_derivation_after_random_writes() {
        let mut rng = rng();
        let mut g = Graph::new();
        let channels = ["email", "chat", "call"];
        for i in 0..30 {
            g.put(Value::node(format!("n{i}")).with_attr("rank", i as f64)).unwrap();
        }
        for i in 0..120 {
            let s = rng.random_range(0..30);
            let t = rng.random_range(0..30);
            let ch = channels[rng.random_range(0..channels.len())];
            g.put(
                Value::edge(format!("e{}", i % 40), format!("n{s}"), format!("n{t}"))
                    .with_axis_attr("channel", Axis::Categorical, ch),
            )
            .unwrap();
        }
        for value in g.values() {
            let expected = derive_facets(value).unwrap();
            assert_eq!(g.get_facets(&value.id).unwrap(), expected.as_slice());
        }
        let total: usize = g.values().map(|v| g.get_facets(&v.id).unwrap().len()).sum();
        assert_eq!(g.facet_index().len(), total);
        assert_eq!(g.edge_count(), 40);
    }
}

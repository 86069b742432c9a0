//! Separation engine: filter, sort and group over facets.
//!
//! Evaluation reads the facet index only; raw attributes are never
//! inspected here.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::facet::FacetValue;
use crate::graph::{FacetKey, Graph, Postings};
use crate::time::{format_compact, parse_iso8601};
use crate::value::{Axis, GeoPoint, ValueId, ValueKind};

/// Which kinds of value a query ranges over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    Nodes,
    Edges,
    #[default]
    Both,
}

impl Population {
    pub fn admits(self, kind: ValueKind) -> bool {
        match self {
            Population::Nodes => kind == ValueKind::Node,
            Population::Edges => kind == ValueKind::Edge,
            Population::Both => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Population::Nodes => "nodes",
            Population::Edges => "edges",
            Population::Both => "both",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Composition {
    #[default]
    And,
    Or,
}

impl Composition {
    pub fn keyword(self) -> &'static str {
        match self {
            Composition::And => "AND",
            Composition::Or => "OR",
        }
    }
}

/// Inclusive time interval in Unix seconds. Serialized as ISO-8601 text;
/// integer seconds are accepted on input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "timestamp")]
    pub start: i64,
    #[serde(with = "timestamp")]
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Whole-day range from two `YYYY-MM-DD` dates; `end` covers its full day.
    pub fn days(start: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: parse_iso8601(start)?,
            end: parse_iso8601(end)?.checked_add(crate::time::SECS_PER_DAY - 1)?,
        })
    }

    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }
}

mod timestamp {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S: Serializer>(secs: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_compact(*secs))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Secs(i64),
            Text(String),
        }
        match Repr::deserialize(d)? {
            Repr::Secs(s) => Ok(s),
            Repr::Text(t) => {
                parse_iso8601(&t).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{t}'")))
            }
        }
    }
}

/// Compiled regular expression compared by its source pattern.
#[derive(Clone, Debug)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Pattern)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Typed test applied to facet values.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Matcher {
    Equals {
        value: FacetValue,
    },
    /// Inclusive bounds; an absent bound is open. Only values of the bound's
    /// type match.
    Range {
        min: Option<FacetValue>,
        max: Option<FacetValue>,
    },
    /// Case-insensitive substring over text facets. Needle is lowercase.
    Contains {
        needle: String,
    },
    Regex {
        pattern: Pattern,
    },
    /// Non-contiguous time selection: matches if any range contains the time.
    During {
        ranges: Vec<TimeRange>,
    },
    Near {
        center: GeoPoint,
        radius_km: f64,
    },
}

impl Matcher {
    fn collect(&self, postings: &Postings, out: &mut BTreeSet<ValueId>) {
        match self {
            Matcher::Equals { value } => {
                if let Some(ids) = postings.get(value) {
                    out.extend(ids.iter().cloned());
                }
            }
            Matcher::Range { min, max } => {
                if let (Some(lo), Some(hi)) = (min, max)
                    && (lo > hi || !lo.same_type(hi))
                {
                    return;
                }
                let Some(sample) = min.as_ref().or(max.as_ref()) else {
                    for ids in postings.values() {
                        out.extend(ids.iter().cloned());
                    }
                    return;
                };
                let lo = min.as_ref().map_or(Bound::Unbounded, Bound::Included);
                let hi = max.as_ref().map_or(Bound::Unbounded, Bound::Included);
                for (value, ids) in postings.range::<FacetValue, _>((lo, hi)) {
                    if value.same_type(sample) {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
            Matcher::Contains { needle } => {
                for (value, ids) in postings {
                    if let Some(text) = value.as_text()
                        && text.to_lowercase().contains(needle.as_str())
                    {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
            Matcher::Regex { pattern } => {
                for (value, ids) in postings {
                    if let Some(text) = value.as_text()
                        && pattern.is_match(text)
                    {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
            Matcher::During { ranges } => {
                for range in ranges.iter().filter(|r| r.start <= r.end) {
                    let lo = FacetValue::Time(range.start);
                    let hi = FacetValue::Time(range.end);
                    for ids in postings.range(lo..=hi).map(|(_, ids)| ids) {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
            Matcher::Near { center, radius_km } => {
                for (value, ids) in postings {
                    if let FacetValue::Point(p) = value
                        && center.distance_km(p) <= *radius_km
                    {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
        }
    }
}

/// One axis-scoped test. `facet: None` tests every facet on the axis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AxisCondition {
    pub axis: Axis,
    pub facet: Option<String>,
    pub matcher: Matcher,
}

/// AND/OR tree of conditions.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Condition(AxisCondition),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn condition(axis: Axis, facet: Option<&str>, matcher: Matcher) -> Self {
        Predicate::Condition(AxisCondition {
            axis,
            facet: facet.map(str::to_string),
            matcher,
        })
    }

    pub fn equals(axis: Axis, facet: &str, value: FacetValue) -> Self {
        Self::condition(axis, Some(facet), Matcher::Equals { value })
    }

    pub fn during(axis: Axis, facet: Option<&str>, ranges: Vec<TimeRange>) -> Self {
        Self::condition(axis, facet, Matcher::During { ranges })
    }

    pub fn compose(mode: Composition, parts: Vec<Predicate>) -> Self {
        match mode {
            Composition::And => Predicate::All(parts),
            Composition::Or => Predicate::Any(parts),
        }
    }

    /// Number of leaf conditions.
    pub fn leaves(&self) -> usize {
        match self {
            Predicate::Condition(_) => 1,
            Predicate::All(ps) | Predicate::Any(ps) => ps.iter().map(Predicate::leaves).sum(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub axis: Axis,
    pub facet: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub descending: bool,
}

impl SortKey {
    pub fn ascending(axis: Axis, facet: &str) -> Self {
        Self {
            axis,
            facet: facet.to_string(),
            descending: false,
        }
    }

    pub fn descending(axis: Axis, facet: &str) -> Self {
        Self {
            axis,
            facet: facet.to_string(),
            descending: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    pub axis: Axis,
    pub facet: String,
}

impl GroupKey {
    pub fn new(axis: Axis, facet: &str) -> Self {
        Self {
            axis,
            facet: facet.to_string(),
        }
    }
}

/// A grouping bucket. `key: None` collects values lacking the facet.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Group {
    pub key: Option<FacetValue>,
    pub ids: Vec<ValueId>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeparationQuery {
    pub predicate: Option<Predicate>,
    pub population: Population,
    pub order: Option<SortKey>,
    pub group_by: Option<GroupKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SeparationResult {
    pub ids: Vec<ValueId>,
    pub groups: Option<Vec<Group>>,
}

pub struct SeparationEngine<'g> {
    graph: &'g Graph,
}

impl<'g> SeparationEngine<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Ids matching `predicate`, any kind, in id order.
    pub fn evaluate(&self, predicate: &Predicate) -> BTreeSet<ValueId> {
        match predicate {
            Predicate::Condition(cond) => self.evaluate_condition(cond),
            Predicate::All(parts) => {
                let mut iter = parts.iter();
                let Some(first) = iter.next() else {
                    return self.graph.ids().cloned().collect();
                };
                let mut acc = self.evaluate(first);
                for part in iter {
                    if acc.is_empty() {
                        break;
                    }
                    let next = self.evaluate(part);
                    acc.retain(|id| next.contains(id));
                }
                acc
            }
            Predicate::Any(parts) => {
                let mut acc = BTreeSet::new();
                for part in parts {
                    acc.extend(self.evaluate(part));
                }
                acc
            }
        }
    }

    fn evaluate_condition(&self, cond: &AxisCondition) -> BTreeSet<ValueId> {
        let index = self.graph.facet_index();
        let mut out = BTreeSet::new();
        match &cond.facet {
            Some(name) => {
                if let Some(postings) = index.postings(&FacetKey::new(cond.axis, name.clone())) {
                    cond.matcher.collect(postings, &mut out);
                }
            }
            None => {
                for (_, postings) in index.keys_on(cond.axis) {
                    cond.matcher.collect(postings, &mut out);
                }
            }
        }
        out
    }

    /// Every value of the population, id order.
    pub fn population(&self, population: Population) -> BTreeSet<ValueId> {
        self.graph
            .values()
            .filter(|v| population.admits(v.kind))
            .map(|v| v.id.clone())
            .collect()
    }

    pub fn run(&self, query: &SeparationQuery) -> SeparationResult {
        let matched = match &query.predicate {
            Some(p) => self.evaluate(p),
            None => self.graph.ids().cloned().collect(),
        };
        self.finish(matched, query)
    }

    /// Like `run`, restricted to `candidates`.
    pub fn run_within(
        &self,
        query: &SeparationQuery,
        candidates: &BTreeSet<ValueId>,
    ) -> SeparationResult {
        let mut matched = match &query.predicate {
            Some(p) => self.evaluate(p),
            None => candidates.clone(),
        };
        matched.retain(|id| candidates.contains(id));
        self.finish(matched, query)
    }

    fn finish(&self, matched: BTreeSet<ValueId>, query: &SeparationQuery) -> SeparationResult {
        let admitted = matched.into_iter().filter(|id| {
            self.graph
                .kind_of(id)
                .is_some_and(|k| query.population.admits(k))
        });
        let ids = order_ids(self.graph, admitted, query.order.as_ref());
        let groups = query
            .group_by
            .as_ref()
            .map(|key| group_ids(self.graph, &ids, key));
        SeparationResult { ids, groups }
    }
}

/// Axis-driven, stable ordering. Values lacking the sort facet go last;
/// ties (and the unsorted case) fall back to id order.
pub fn order_ids(
    graph: &Graph,
    ids: impl IntoIterator<Item = ValueId>,
    sort: Option<&SortKey>,
) -> Vec<ValueId> {
    let Some(sort) = sort else {
        let mut ids: Vec<ValueId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        return ids;
    };

    let index = graph.facet_index();
    let mut keyed: Vec<(Option<FacetValue>, ValueId)> = ids
        .into_iter()
        .map(|id| {
            let mut values = index.values_of(&id, sort.axis, &sort.facet);
            let key = if sort.descending {
                values.max().cloned()
            } else {
                values.min().cloned()
            };
            (key, id)
        })
        .collect();

    keyed.sort_by(|(ka, ia), (kb, ib)| {
        let by_key = match (ka, kb) {
            (Some(a), Some(b)) if sort.descending => b.cmp(a),
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_key.then_with(|| ia.cmp(ib))
    });
    keyed.dedup_by(|a, b| a.1 == b.1);
    keyed.into_iter().map(|(_, id)| id).collect()
}

/// Bucket already-ordered ids by a facet. A value with several facet values
/// (tags) lands in each of their buckets; order within a bucket is preserved.
pub fn group_ids(graph: &Graph, ordered: &[ValueId], key: &GroupKey) -> Vec<Group> {
    let index = graph.facet_index();
    let mut buckets: BTreeMap<FacetValue, Vec<ValueId>> = BTreeMap::new();
    let mut missing = Vec::new();

    for id in ordered {
        let mut any = false;
        for value in index.values_of(id, key.axis, &key.facet) {
            buckets.entry(value.clone()).or_default().push(id.clone());
            any = true;
        }
        if !any {
            missing.push(id.clone());
        }
    }

    let mut groups: Vec<Group> = buckets
        .into_iter()
        .map(|(k, ids)| Group { key: Some(k), ids })
        .collect();
    if !missing.is_empty() {
        groups.push(Group {
            key: None,
            ids: missing,
        });
    }
    groups
}

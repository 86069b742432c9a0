//! Canonical filter state: one filter per axis family plus composition
//! modes. This is what the UI edits, what history snapshots, and what the
//! compiler translates.

use serde::{Deserialize, Serialize};

use crate::connection::{Direction, RecentSpec};
use crate::separation::{Composition, GroupKey, Population, SortKey, TimeRange};
use crate::value::{Axis, ValueId};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterState {
    /// How the per-axis filters combine.
    pub mode: Composition,
    pub population: Population,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spatial: Option<AxisFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical: Option<AxisFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal: Option<AxisFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categorical: Option<AxisFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<AxisFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relational: Option<RelationalFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupKey>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: Composition) -> Self {
        self.mode = mode;
        self
    }

    pub fn population(mut self, population: Population) -> Self {
        self.population = population;
        self
    }

    /// Set the filter of one axis family. For `Relational` this sets the
    /// facet conditions and keeps any link query.
    pub fn with(mut self, axis: Axis, filter: AxisFilter) -> Self {
        match axis {
            Axis::Spatial => self.spatial = Some(filter),
            Axis::Lexical => self.lexical = Some(filter),
            Axis::Temporal => self.temporal = Some(filter),
            Axis::Categorical => self.categorical = Some(filter),
            Axis::Ordinal => self.ordinal = Some(filter),
            Axis::Relational => {
                let links = self.relational.take().and_then(|r| r.links);
                self.relational = Some(RelationalFilter { filter, links });
            }
        }
        self
    }

    pub fn linked(mut self, links: LinkQuery) -> Self {
        let filter = self.relational.take().map(|r| r.filter).unwrap_or_default();
        self.relational = Some(RelationalFilter {
            filter,
            links: Some(links),
        });
        self
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn grouped_by(mut self, key: GroupKey) -> Self {
        self.group_by = Some(key);
        self
    }

    pub fn axis(&self, axis: Axis) -> Option<&AxisFilter> {
        match axis {
            Axis::Spatial => self.spatial.as_ref(),
            Axis::Lexical => self.lexical.as_ref(),
            Axis::Temporal => self.temporal.as_ref(),
            Axis::Categorical => self.categorical.as_ref(),
            Axis::Ordinal => self.ordinal.as_ref(),
            Axis::Relational => self.relational.as_ref().map(|r| &r.filter),
        }
    }

    /// Axis filters that carry at least one condition, canonical axis order.
    pub fn active_axes(&self) -> impl Iterator<Item = (Axis, &AxisFilter)> {
        Axis::ALL
            .into_iter()
            .filter_map(|axis| self.axis(axis).map(|f| (axis, f)))
            .filter(|(_, f)| !f.conditions.is_empty())
    }

    pub fn links(&self) -> Option<&LinkQuery> {
        self.relational.as_ref().and_then(|r| r.links.as_ref())
    }

    /// True when the state selects the whole population unchanged.
    pub fn is_unfiltered(&self) -> bool {
        self.active_axes().next().is_none() && self.links().is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisFilter {
    /// How this axis's conditions combine.
    pub mode: Composition,
    pub conditions: Vec<Condition>,
}

impl AxisFilter {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            mode: Composition::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            mode: Composition::Or,
            conditions,
        }
    }
}

/// One condition: an operator applied to a named facet, or to every facet
/// on the axis when `facet` is absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet: Option<String>,
    #[serde(flatten)]
    pub op: Op,
}

impl Condition {
    pub fn new(facet: Option<&str>, op: Op) -> Self {
        Self {
            facet: facet.map(str::to_string),
            op,
        }
    }

    pub fn equals(facet: &str, value: impl Into<Operand>) -> Self {
        Self::new(
            Some(facet),
            Op::Equals {
                value: value.into(),
            },
        )
    }

    pub fn range(facet: &str, min: Option<Operand>, max: Option<Operand>) -> Self {
        Self::new(Some(facet), Op::Range { min, max })
    }

    pub fn contains(facet: Option<&str>, text: &str) -> Self {
        Self::new(
            facet,
            Op::Contains {
                text: text.to_string(),
            },
        )
    }

    pub fn regex(facet: Option<&str>, pattern: &str) -> Self {
        Self::new(
            facet,
            Op::Regex {
                pattern: pattern.to_string(),
            },
        )
    }

    pub fn during(facet: Option<&str>, ranges: Vec<TimeRange>) -> Self {
        Self::new(facet, Op::During { ranges })
    }

    pub fn near(facet: Option<&str>, lat: f64, lon: f64, radius_km: f64) -> Self {
        Self::new(facet, Op::Near { lat, lon, radius_km })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Equals {
        value: Operand,
    },
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<Operand>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<Operand>,
    },
    Contains {
        text: String,
    },
    Regex {
        pattern: String,
    },
    During {
        ranges: Vec<TimeRange>,
    },
    Near {
        lat: f64,
        lon: f64,
        radius_km: f64,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Equals { .. } => "equals",
            Op::Range { .. } => "range",
            Op::Contains { .. } => "contains",
            Op::Regex { .. } => "regex",
            Op::During { .. } => "during",
            Op::Near { .. } => "near",
        }
    }
}

/// Untyped literal from the UI; the compiler converts it to the axis type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Operand::Text(s.to_string())
    }
}

impl From<f64> for Operand {
    fn from(n: f64) -> Self {
        Operand::Number(n)
    }
}

impl From<bool> for Operand {
    fn from(b: bool) -> Self {
        Operand::Bool(b)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationalFilter {
    #[serde(flatten)]
    pub filter: AxisFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<LinkQuery>,
}

/// Connection operation anchored at explicit seed nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkQuery {
    pub seeds: Vec<ValueId>,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub operation: ConnectionOp,
}

fn default_depth() -> usize {
    1
}

impl LinkQuery {
    pub fn new(seeds: &[&str], depth: usize) -> Self {
        Self {
            seeds: seeds.iter().map(|s| ValueId::from(*s)).collect(),
            depth,
            direction: Direction::Both,
            operation: ConnectionOp::Neighborhood,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn operation(mut self, operation: ConnectionOp) -> Self {
        self.operation = operation;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConnectionOp {
    /// Everything within `depth` of the seeds.
    #[default]
    Neighborhood,
    /// Shortest path from the (single) seed to `to`.
    Path { to: ValueId },
    Aggregate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recent: Option<RecentSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<GroupKey>,
    },
    Rank {
        #[serde(default)]
        algorithm: RankAlgorithm,
    },
    Clusters,
}

impl ConnectionOp {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionOp::Neighborhood => "neighborhood",
            ConnectionOp::Path { .. } => "path",
            ConnectionOp::Aggregate { .. } => "aggregate",
            ConnectionOp::Rank { .. } => "rank",
            ConnectionOp::Clusters => "clusters",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankAlgorithm {
    #[default]
    Degree,
    Influence,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(state: &FilterState) -> FilterState {
        let json = serde_json::to_string(state).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_empty_state_roundtrip() {
        let state = FilterState::new();
        assert_eq!(serde_json::to_string(&state).unwrap(), r#"{"mode":"and","population":"both"}"#);
        assert_eq!(roundtrip(&state), state);
        assert_eq!(serde_json::from_str::<FilterState>("{}").unwrap(), state);
        assert!(state.is_unfiltered());
    }

    #[test]
    fn test_parse_ui_json() {
        let json = r#"{
            "mode": "and",
            "population": "edges",
            "categorical": {"conditions": [{"facet": "channel", "op": "equals", "value": "email"}]},
            "temporal": {"conditions": [{"facet": "sent", "op": "during", "ranges": [
                {"start": "2024-01-01", "end": "2024-01-05T23:59:59"},
                {"start": "2024-03-01", "end": "2024-03-03"}
            ]}]},
            "relational": {"links": {"seeds": ["bob"], "operation": {"op": "aggregate"}}}
        }"#;
        let state: FilterState = serde_json::from_str(json).unwrap();
        assert_eq!(state.population, Population::Edges);
        let cat = state.categorical.as_ref().unwrap();
        assert_eq!(cat.conditions[0], Condition::equals("channel", "email"));
        let links = state.links().unwrap();
        assert_eq!(links.depth, 1);
        assert_eq!(links.direction, Direction::Both);
        assert_eq!(links.operation.name(), "aggregate");
        let axes: Vec<Axis> = state.active_axes().map(|(a, _)| a).collect();
        assert_eq!(axes, vec![Axis::Temporal, Axis::Categorical]);
    }

    #[test]
    fn test_six_axis_mixed_roundtrip() {
        let state = FilterState::new()
            .mode(Composition::Or)
            .with(
                Axis::Spatial,
                AxisFilter::all(vec![Condition::near(Some("office"), 41.88, -87.63, 25.0)]),
            )
            .with(
                Axis::Lexical,
                AxisFilter::any(vec![
                    Condition::contains(None, "budget"),
                    Condition::regex(Some("title"), "^Q[1-4]"),
                ]),
            )
            .with(
                Axis::Temporal,
                AxisFilter::all(vec![Condition::during(
                    Some("due"),
                    vec![TimeRange::new(0, 86_399), TimeRange::new(172_800, 172_900)],
                )]),
            )
            .with(
                Axis::Categorical,
                AxisFilter::any(vec![
                    Condition::equals("status", "open"),
                    Condition::equals("urgent", true),
                ]),
            )
            .with(
                Axis::Ordinal,
                AxisFilter::all(vec![Condition::range("priority", Some(1.0.into()), None)]),
            )
            .with(
                Axis::Relational,
                AxisFilter::all(vec![Condition::equals("source", "alice")]),
            )
            .linked(
                LinkQuery::new(&["alice"], 2)
                    .direction(Direction::Outgoing)
                    .operation(ConnectionOp::Rank {
                        algorithm: RankAlgorithm::Influence,
                    }),
            )
            .sorted_by(SortKey::descending(Axis::Temporal, "due"))
            .grouped_by(GroupKey::new(Axis::Categorical, "status"));

        assert_eq!(state.active_axes().count(), 6);
        assert_eq!(roundtrip(&state), state);
    }

    #[test]
    fn test_with_relational_keeps_links() {
        let state = FilterState::new()
            .linked(LinkQuery::new(&["a"], 3))
            .with(Axis::Relational, AxisFilter::all(vec![]));
        assert_eq!(state.links().unwrap().depth, 3);
    }
}

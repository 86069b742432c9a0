//! Projection of a result set onto a view model.
//!
//! No filtering happens here. A value that cannot be placed in the
//! requested view is listed as an exclusion with the facet it lacks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::facet::FacetValue;
use crate::graph::{FacetKey, Graph};
use crate::time::{SECS_PER_DAY, civil_from_unix, unix_from_civil, unix_to_date, weekday};
use crate::value::{Axis, ValueId, ValueKind};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Column {
    pub axis: Axis,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    #[default]
    Day,
    /// ISO weeks, starting Monday.
    Week,
    Month,
    Year,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ViewKind {
    /// Rows of values; `columns: None` uses every facet key present.
    Grid {
        #[serde(default)]
        columns: Option<Vec<Column>>,
    },
    Network,
    Kanban {
        axis: Axis,
        facet: String,
    },
    /// `facet: None` buckets by the earliest temporal facet of any name.
    Timeline {
        #[serde(default)]
        facet: Option<String>,
        #[serde(default)]
        bucket: Bucket,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Projection {
    pub view: View,
    pub excluded: Vec<Exclusion>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Exclusion {
    pub id: ValueId,
    pub reason: ExclusionReason,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    MissingFacet { axis: Axis, facet: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum View {
    Grid(GridView),
    Network(NetworkView),
    Kanban(KanbanView),
    Timeline(TimelineView),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GridView {
    pub columns: Vec<Column>,
    pub rows: Vec<GridRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GridRow {
    pub id: ValueId,
    pub kind: ValueKind,
    pub label: String,
    /// One cell per column; multi-valued facets are comma-joined.
    pub cells: Vec<Option<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkView {
    pub nodes: Vec<NetworkNode>,
    pub edges: Vec<NetworkEdge>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkNode {
    pub id: ValueId,
    pub label: String,
    /// Not in the result; present so a matched edge has both endpoints.
    pub context: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkEdge {
    pub id: ValueId,
    pub source: ValueId,
    pub target: ValueId,
    pub directed: bool,
    /// Not in the result; connects two result nodes.
    pub context: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KanbanView {
    pub axis: Axis,
    pub facet: String,
    pub lanes: Vec<Lane>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Lane {
    pub key: FacetValue,
    pub ids: Vec<ValueId>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelineView {
    pub facet: Option<String>,
    pub bucket: Bucket,
    pub buckets: Vec<TimeBucket>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimeBucket {
    pub start: i64,
    pub label: String,
    pub ids: Vec<ValueId>,
}

/// Project `ids` (in result order) onto `kind`. Unknown ids are an error.
pub fn project(graph: &Graph, ids: &[ValueId], kind: &ViewKind) -> Result<Projection> {
    for id in ids {
        graph.get(id)?;
    }
    let mut excluded = Vec::new();
    let view = match kind {
        ViewKind::Grid { columns } => View::Grid(grid(graph, ids, columns.as_deref())),
        ViewKind::Network => View::Network(network(graph, ids)),
        ViewKind::Kanban { axis, facet } => {
            View::Kanban(kanban(graph, ids, *axis, facet, &mut excluded))
        }
        ViewKind::Timeline { facet, bucket } => {
            View::Timeline(timeline(graph, ids, facet.as_deref(), *bucket, &mut excluded))
        }
    };
    Ok(Projection { view, excluded })
}

fn grid(graph: &Graph, ids: &[ValueId], columns: Option<&[Column]>) -> GridView {
    let index = graph.facet_index();
    let columns: Vec<Column> = match columns {
        Some(cols) => cols.to_vec(),
        None => {
            let keys: BTreeSet<Column> = ids
                .iter()
                .flat_map(|id| index.facets_of(id))
                .map(|f| Column {
                    axis: f.axis,
                    name: f.name.clone(),
                })
                .collect();
            keys.into_iter().collect()
        }
    };

    let rows = ids
        .iter()
        .filter_map(|id| graph.get(id).ok())
        .map(|value| {
            let cells = columns
                .iter()
                .map(|col| {
                    let rendered: Vec<String> = index
                        .values_of(&value.id, col.axis, &col.name)
                        .map(|v| v.to_string())
                        .collect();
                    (!rendered.is_empty()).then(|| rendered.join(", "))
                })
                .collect();
            GridRow {
                id: value.id.clone(),
                kind: value.kind,
                label: value.label(),
                cells,
            }
        })
        .collect();
    GridView { columns, rows }
}

fn network(graph: &Graph, ids: &[ValueId]) -> NetworkView {
    let in_result: BTreeSet<&ValueId> = ids.iter().collect();
    let result_nodes: BTreeSet<&ValueId> = ids
        .iter()
        .filter(|id| graph.kind_of(id) == Some(ValueKind::Node))
        .collect();

    let mut nodes: Vec<NetworkNode> = Vec::new();
    let mut placed: BTreeSet<&ValueId> = BTreeSet::new();
    let mut place = |id: &ValueId, context: bool, nodes: &mut Vec<NetworkNode>| {
        if let Ok(value) = graph.get(id)
            && placed.insert(&value.id)
        {
            nodes.push(NetworkNode {
                id: value.id.clone(),
                label: value.label(),
                context,
            });
        }
    };
    for id in &result_nodes {
        place(id, false, &mut nodes);
    }

    let mut edges = Vec::new();
    let mut seen_edges: BTreeSet<&ValueId> = BTreeSet::new();
    for value in ids.iter().filter_map(|id| graph.get(id).ok()) {
        let Some(link) = &value.link else { continue };
        place(&link.source, !in_result.contains(&link.source), &mut nodes);
        place(&link.target, !in_result.contains(&link.target), &mut nodes);
        seen_edges.insert(&value.id);
        edges.push(NetworkEdge {
            id: value.id.clone(),
            source: link.source.clone(),
            target: link.target.clone(),
            directed: link.directed,
            context: false,
        });
    }

    for node in &result_nodes {
        for edge_id in graph.outgoing(node) {
            if seen_edges.contains(edge_id) {
                continue;
            }
            let Some(link) = graph.get(edge_id).ok().and_then(|v| v.link.as_ref()) else {
                continue;
            };
            if result_nodes.contains(&link.target) {
                seen_edges.insert(edge_id);
                edges.push(NetworkEdge {
                    id: edge_id.clone(),
                    source: link.source.clone(),
                    target: link.target.clone(),
                    directed: link.directed,
                    context: true,
                });
            }
        }
    }

    NetworkView { nodes, edges }
}

fn kanban(
    graph: &Graph,
    ids: &[ValueId],
    axis: Axis,
    facet: &str,
    excluded: &mut Vec<Exclusion>,
) -> KanbanView {
    let index = graph.facet_index();
    let mut lanes: BTreeMap<FacetValue, Vec<ValueId>> = BTreeMap::new();
    for id in ids {
        let mut placed = false;
        for value in index.values_of(id, axis, facet) {
            lanes.entry(value.clone()).or_default().push(id.clone());
            placed = true;
        }
        if !placed {
            excluded.push(missing(id, axis, facet));
        }
    }
    KanbanView {
        axis,
        facet: facet.to_string(),
        lanes: lanes
            .into_iter()
            .map(|(key, ids)| Lane { key, ids })
            .collect(),
    }
}

fn timeline(
    graph: &Graph,
    ids: &[ValueId],
    facet: Option<&str>,
    bucket: Bucket,
    excluded: &mut Vec<Exclusion>,
) -> TimelineView {
    let index = graph.facet_index();
    let mut buckets: BTreeMap<i64, Vec<ValueId>> = BTreeMap::new();
    for id in ids {
        let earliest = index
            .facets_of(id)
            .iter()
            .filter(|f| f.axis == Axis::Temporal && facet.is_none_or(|name| f.name == name))
            .filter_map(|f| f.value.as_time())
            .min();
        match earliest {
            Some(t) => buckets.entry(bucket_start(t, bucket)).or_default().push(id.clone()),
            None => excluded.push(missing(id, Axis::Temporal, facet.unwrap_or("*"))),
        }
    }
    TimelineView {
        facet: facet.map(str::to_string),
        bucket,
        buckets: buckets
            .into_iter()
            .map(|(start, ids)| TimeBucket {
                start,
                label: bucket_label(start, bucket),
                ids,
            })
            .collect(),
    }
}

fn missing(id: &ValueId, axis: Axis, facet: &str) -> Exclusion {
    Exclusion {
        id: id.clone(),
        reason: ExclusionReason::MissingFacet {
            axis,
            facet: facet.to_string(),
        },
    }
}

pub fn bucket_start(t: i64, bucket: Bucket) -> i64 {
    let day = t - t.rem_euclid(SECS_PER_DAY);
    match bucket {
        Bucket::Day => day,
        Bucket::Week => day.saturating_sub(weekday(day) as i64 * SECS_PER_DAY),
        Bucket::Month => {
            let (y, m, _) = civil_from_unix(t);
            unix_from_civil(y, m, 1)
        }
        Bucket::Year => {
            let (y, _, _) = civil_from_unix(t);
            unix_from_civil(y, 1, 1)
        }
    }
}

fn bucket_label(start: i64, bucket: Bucket) -> String {
    let (y, m, _) = civil_from_unix(start);
    match bucket {
        Bucket::Day | Bucket::Week => unix_to_date(start),
        Bucket::Month => format!("{y:04}-{m:02}"),
        Bucket::Year => format!("{y:04}"),
    }
}

impl Projection {
    /// Facet keys named by exclusions, for diagnostics.
    pub fn missing_keys(&self) -> BTreeSet<FacetKey> {
        self.excluded
            .iter()
            .map(|e| match &e.reason {
                ExclusionReason::MissingFacet { axis, facet } => FacetKey::new(*axis, facet.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_iso8601;
    use crate::value::Value;

    fn board() -> Graph {
        let mut g = Graph::new();
        g.put(
            Value::node("t1")
                .with_attr("title", "Write docs")
                .with_axis_attr("status", Axis::Categorical, "open")
                .with_axis_attr("due", Axis::Temporal, "2024-01-03"),
        )
        .unwrap();
        g.put(
            Value::node("t2")
                .with_attr("title", "Fix bug")
                .with_tags("labels", &["backend", "urgent"])
                .with_axis_attr("status", Axis::Categorical, "done")
                .with_axis_attr("due", Axis::Temporal, "2024-01-08"),
        )
        .unwrap();
        g.put(Value::node("t3").with_attr("title", "Someday")).unwrap();
        g.put(Value::edge("blocks", "t2", "t1")).unwrap();
        g
    }

    fn ids(list: &[&str]) -> Vec<ValueId> {
        list.iter().map(|s| ValueId::from(*s)).collect()
    }

    #[test]
    fn test_grid_default_columns_are_union() {
        let g = board();
        let p = project(&g, &ids(&["t1", "t3"]), &ViewKind::Grid { columns: None }).unwrap();
        let View::Grid(grid) = p.view else { panic!("grid expected") };
        let names: Vec<&str> = grid.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["title", "due", "status"]);
        assert_eq!(grid.rows[1].cells, vec![Some("Someday".to_string()), None, None]);
        assert!(p.excluded.is_empty());
    }

    #[test]
    fn test_network_adds_context_endpoints() {
        let g = board();
        let p = project(&g, &ids(&["blocks"]), &ViewKind::Network).unwrap();
        let View::Network(net) = p.view else { panic!("network expected") };
        assert_eq!(net.edges.len(), 1);
        assert_eq!(net.nodes.len(), 2);
        assert!(net.nodes.iter().all(|n| n.context));

        let p = project(&g, &ids(&["t1", "t2"]), &ViewKind::Network).unwrap();
        let View::Network(net) = p.view else { panic!("network expected") };
        assert_eq!(net.edges.len(), 1);
        assert!(net.edges[0].context);
    }

    #[test]
    fn test_kanban_lanes_and_exclusions() {
        let g = board();
        let p = project(
            &g,
            &ids(&["t1", "t2", "t3"]),
            &ViewKind::Kanban {
                axis: Axis::Categorical,
                facet: "status".into(),
            },
        )
        .unwrap();
        let View::Kanban(board) = &p.view else { panic!("kanban expected") };
        let lanes: Vec<String> = board.lanes.iter().map(|l| l.key.to_string()).collect();
        assert_eq!(lanes, vec!["done", "open"]);
        assert_eq!(p.excluded.len(), 1);
        assert_eq!(p.excluded[0].id.as_str(), "t3");
        assert!(p.missing_keys().contains(&FacetKey::new(Axis::Categorical, "status")));
    }

    #[test]
    fn test_kanban_multi_valued_lane() {
        let g = board();
        let p = project(
            &g,
            &ids(&["t2"]),
            &ViewKind::Kanban {
                axis: Axis::Categorical,
                facet: "labels".into(),
            },
        )
        .unwrap();
        let View::Kanban(board) = p.view else { panic!("kanban expected") };
        assert_eq!(board.lanes.len(), 2);
    }

    #[test]
    fn test_timeline_weeks_start_monday() {
        let g = board();
        let p = project(
            &g,
            &ids(&["t1", "t2", "t3"]),
            &ViewKind::Timeline {
                facet: Some("due".into()),
                bucket: Bucket::Week,
            },
        )
        .unwrap();
        let View::Timeline(tl) = p.view else { panic!("timeline expected") };
        let labels: Vec<&str> = tl.buckets.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2024-01-01", "2024-01-08"]);
        assert_eq!(p.excluded.len(), 1);
    }

    #[test]
    fn test_bucket_starts() {
        let t = parse_iso8601("2024-03-14T15:09:26").unwrap();
        assert_eq!(unix_to_date(bucket_start(t, Bucket::Day)), "2024-03-14");
        assert_eq!(unix_to_date(bucket_start(t, Bucket::Week)), "2024-03-11");
        assert_eq!(unix_to_date(bucket_start(t, Bucket::Month)), "2024-03-01");
        assert_eq!(unix_to_date(bucket_start(t, Bucket::Year)), "2024-01-01");
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let g = board();
        assert!(project(&g, &ids(&["nope"]), &ViewKind::Network).is_err());
    }
}

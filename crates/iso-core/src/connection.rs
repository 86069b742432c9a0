//! Connection engine: traversal, aggregation and clustering along edges.
//!
//! Every operation starts from a seed set of nodes and only sees edges
//! reachable from it. A `Scope` narrows the visible graph further (the
//! executor passes the candidates left by earlier separation steps).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::{RankConfig, TraversalConfig};
use crate::error::{IsoError, Result};
use crate::graph::Graph;
use crate::separation::{GroupKey, SortKey, order_ids};
use crate::value::{Value, ValueId, ValueKind};

/// Which way directed edges may be followed. Undirected edges are always
/// traversable both ways.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

impl Direction {
    pub fn keyword(self) -> &'static str {
        match self {
            Direction::Outgoing => "OUT",
            Direction::Incoming => "IN",
            Direction::Both => "BOTH",
        }
    }
}

/// Optional restriction of the visible graph. `None` means unrestricted.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scope<'s> {
    pub nodes: Option<&'s BTreeSet<ValueId>>,
    pub edges: Option<&'s BTreeSet<ValueId>>,
}

impl Scope<'_> {
    fn allows_node(&self, id: &ValueId) -> bool {
        self.nodes.is_none_or(|set| set.contains(id))
    }

    fn allows_edge(&self, id: &ValueId) -> bool {
        self.edges.is_none_or(|set| set.contains(id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reached {
    pub id: ValueId,
    pub depth: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Traversal {
    /// Reached nodes in breadth-first order, seeds first.
    pub nodes: Vec<Reached>,
    /// Edges followed, in id order.
    pub edges: Vec<ValueId>,
    pub truncated: bool,
}

impl Traversal {
    pub fn node_ids(&self) -> BTreeSet<ValueId> {
        self.nodes.iter().map(|r| r.id.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Path {
    pub nodes: Vec<ValueId>,
    pub edges: Vec<ValueId>,
}

impl Path {
    pub fn hops(&self) -> usize {
        self.edges.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PathResult {
    pub path: Option<Path>,
    pub truncated: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecentSpec {
    pub limit: usize,
    pub order: SortKey,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateSpec {
    pub recent: Option<RecentSpec>,
    pub group_by: Option<GroupKey>,
}

/// Per-node summary over the node's incident edges within the traversal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node: ValueId,
    pub edge_count: usize,
    pub recent: Vec<ValueId>,
    /// Edge counts per group facet value; edges lacking the facet are not
    /// counted here.
    pub by_group: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Aggregation {
    pub edges: Vec<ValueId>,
    pub summaries: Vec<NodeSummary>,
    pub truncated: bool,
}

pub struct ConnectionEngine<'a> {
    graph: &'a Graph,
    direction: Direction,
    budget: usize,
    scope: Scope<'a>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> ConnectionEngine<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        Self {
            graph,
            direction: Direction::Both,
            budget: TraversalConfig::default().visit_budget,
            scope: Scope::default(),
            cancel: None,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Maximum number of nodes a single operation may reach.
    pub fn budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn within(mut self, scope: Scope<'a>) -> Self {
        self.scope = scope;
        self
    }

    pub fn cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn checkpoint(&self) -> Result<()> {
        match self.cancel {
            Some(token) => token.checkpoint(),
            None => Ok(()),
        }
    }

    fn check_node(&self, id: &ValueId) -> Result<()> {
        match self.graph.kind_of(id) {
            None => Err(IsoError::NotFound(id.clone())),
            Some(ValueKind::Edge) => Err(IsoError::InvalidArgument(format!(
                "{id} is an edge; connection operations start from nodes"
            ))),
            Some(ValueKind::Node) => Ok(()),
        }
    }

    /// `(edge, neighbour)` pairs leaving `node`, respecting direction and scope.
    fn steps(&self, node: &ValueId) -> Vec<(&'a ValueId, &'a ValueId)> {
        let graph = self.graph;
        let mut out = Vec::new();
        for edge in graph.outgoing(node) {
            let Some(link) = graph.get(edge).ok().and_then(|v| v.link.as_ref()) else {
                continue;
            };
            if link.directed && self.direction == Direction::Incoming {
                continue;
            }
            out.push((edge, &link.target));
        }
        for edge in graph.incoming(node) {
            let Some(link) = graph.get(edge).ok().and_then(|v| v.link.as_ref()) else {
                continue;
            };
            if link.directed && self.direction == Direction::Outgoing {
                continue;
            }
            out.push((edge, &link.source));
        }
        out.retain(|(edge, next)| self.scope.allows_edge(edge) && self.scope.allows_node(next));
        out.sort();
        out.dedup();
        out
    }

    /// All nodes within `depth` hops of the seeds. Each node is visited at
    /// most once, so cycles terminate. An empty seed set yields an empty
    /// traversal.
    pub fn traverse(&self, seeds: &[ValueId], depth: usize) -> Result<Traversal> {
        for seed in seeds {
            self.check_node(seed)?;
        }

        let mut seen: BTreeSet<ValueId> = BTreeSet::new();
        let mut out = Traversal::default();
        let mut edges = BTreeSet::new();
        let mut queue = VecDeque::new();

        for seed in seeds {
            if seen.contains(seed) {
                continue;
            }
            if seen.len() >= self.budget {
                out.truncated = true;
                break;
            }
            seen.insert(seed.clone());
            out.nodes.push(Reached {
                id: seed.clone(),
                depth: 0,
            });
            queue.push_back((seed.clone(), 0));
        }

        'bfs: while let Some((node, d)) = queue.pop_front() {
            self.checkpoint()?;
            if d >= depth {
                continue;
            }
            for (edge, next) in self.steps(&node) {
                if !seen.contains(next) {
                    if seen.len() >= self.budget {
                        out.truncated = true;
                        break 'bfs;
                    }
                    seen.insert(next.clone());
                    out.nodes.push(Reached {
                        id: next.clone(),
                        depth: d + 1,
                    });
                    queue.push_back((next.clone(), d + 1));
                }
                edges.insert(edge.clone());
            }
        }

        out.edges = edges.into_iter().collect();
        Ok(out)
    }

    /// Fewest-hop path from `from` to `to`, at most `max_depth` hops.
    /// Ties resolve toward lower edge ids.
    pub fn shortest_path(&self, from: &ValueId, to: &ValueId, max_depth: usize) -> Result<PathResult> {
        self.check_node(from)?;
        self.check_node(to)?;
        if from == to {
            return Ok(PathResult {
                path: Some(Path {
                    nodes: vec![from.clone()],
                    edges: Vec::new(),
                }),
                truncated: false,
            });
        }

        let mut parent: HashMap<ValueId, (ValueId, ValueId)> = HashMap::new();
        let mut seen: BTreeSet<ValueId> = BTreeSet::from([from.clone()]);
        let mut queue = VecDeque::from([(from.clone(), 0usize)]);
        let mut truncated = false;
        let mut found = false;

        'bfs: while let Some((node, d)) = queue.pop_front() {
            self.checkpoint()?;
            if d >= max_depth {
                continue;
            }
            for (edge, next) in self.steps(&node) {
                if seen.contains(next) {
                    continue;
                }
                if seen.len() >= self.budget {
                    truncated = true;
                    break 'bfs;
                }
                seen.insert(next.clone());
                parent.insert(next.clone(), (node.clone(), edge.clone()));
                if next == to {
                    found = true;
                    break 'bfs;
                }
                queue.push_back((next.clone(), d + 1));
            }
        }

        if !found {
            return Ok(PathResult {
                path: None,
                truncated,
            });
        }

        let mut nodes = vec![to.clone()];
        let mut edges = Vec::new();
        let mut cursor = to.clone();
        while let Some((prev, edge)) = parent.get(&cursor) {
            edges.push(edge.clone());
            nodes.push(prev.clone());
            cursor = prev.clone();
        }
        nodes.reverse();
        edges.reverse();
        Ok(PathResult {
            path: Some(Path { nodes, edges }),
            truncated,
        })
    }

    /// Traverse, then summarize every reached node over its incident edges
    /// among those followed.
    pub fn aggregate(
        &self,
        seeds: &[ValueId],
        depth: usize,
        spec: &AggregateSpec,
    ) -> Result<Aggregation> {
        let traversal = self.traverse(seeds, depth)?;
        let followed: BTreeSet<&ValueId> = traversal.edges.iter().collect();
        let index = self.graph.facet_index();

        let mut summaries = Vec::with_capacity(traversal.nodes.len());
        for reached in &traversal.nodes {
            self.checkpoint()?;
            let incident: Vec<ValueId> = self
                .graph
                .incident_edges(&reached.id)
                .into_iter()
                .filter(|e| followed.contains(e))
                .collect();

            let recent = match &spec.recent {
                Some(r) => order_ids(self.graph, incident.iter().cloned(), Some(&r.order))
                    .into_iter()
                    .take(r.limit)
                    .collect(),
                None => Vec::new(),
            };

            let mut by_group = BTreeMap::new();
            if let Some(key) = &spec.group_by {
                for edge in &incident {
                    for value in index.values_of(edge, key.axis, &key.facet) {
                        *by_group.entry(value.to_string()).or_insert(0) += 1;
                    }
                }
            }

            summaries.push(NodeSummary {
                node: reached.id.clone(),
                edge_count: incident.len(),
                recent,
                by_group,
            });
        }

        Ok(Aggregation {
            edges: traversal.edges,
            summaries,
            truncated: traversal.truncated,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
struct SubLink {
    source: ValueId,
    target: ValueId,
    directed: bool,
}

/// A narrowed node set with the edges running between its members.
/// Clustering and ranking operate on this, never on the whole store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subgraph {
    nodes: BTreeSet<ValueId>,
    links: Vec<SubLink>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Centrality {
    pub id: ValueId,
    pub degree: usize,
    pub score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Scored {
    pub id: ValueId,
    pub score: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Ranking {
    pub ranked: Vec<Scored>,
    pub iterations: usize,
    pub converged: bool,
    /// Iteration limit hit before convergence.
    pub truncated: bool,
}

impl Subgraph {
    /// `nodes` plus every edge with both endpoints among them. When `edges`
    /// is given only those edges are considered.
    pub fn induced(graph: &Graph, nodes: BTreeSet<ValueId>, edges: Option<&BTreeSet<ValueId>>) -> Self {
        let candidates: Vec<&Value> = match edges {
            Some(set) => set.iter().filter_map(|id| graph.get(id).ok()).collect(),
            None => graph.edges().collect(),
        };
        let links = candidates
            .into_iter()
            .filter_map(|v| v.link.as_ref())
            .filter(|l| nodes.contains(&l.source) && nodes.contains(&l.target))
            .map(|l| SubLink {
                source: l.source.clone(),
                target: l.target.clone(),
                directed: l.directed,
            })
            .collect();
        Self { nodes, links }
    }

    pub fn from_traversal(graph: &Graph, traversal: &Traversal) -> Self {
        let edges: BTreeSet<ValueId> = traversal.edges.iter().cloned().collect();
        Self::induced(graph, traversal.node_ids(), Some(&edges))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.links.len()
    }

    /// Degree normalized by `n - 1`, highest first.
    pub fn degree_centrality(&self) -> Vec<Centrality> {
        let mut degree: BTreeMap<&ValueId, usize> = self.nodes.iter().map(|id| (id, 0)).collect();
        for link in &self.links {
            for end in [&link.source, &link.target] {
                if let Some(d) = degree.get_mut(end) {
                    *d += 1;
                }
            }
        }
        let denom = self.nodes.len().saturating_sub(1).max(1) as f64;
        let mut out: Vec<Centrality> = degree
            .into_iter()
            .map(|(id, degree)| Centrality {
                id: id.clone(),
                degree,
                score: degree as f64 / denom,
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Influence ranking by power iteration over edge direction (PageRank).
    /// Undirected edges pass influence both ways; dangling mass is spread
    /// uniformly. Checks `cancel` once per iteration.
    pub fn influence_rank(&self, cfg: &RankConfig, cancel: Option<&CancelToken>) -> Result<Ranking> {
        let n = self.nodes.len();
        if n == 0 {
            return Ok(Ranking {
                converged: true,
                ..Ranking::default()
            });
        }

        let ids: Vec<&ValueId> = self.nodes.iter().collect();
        let pos: HashMap<&ValueId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut arcs = Vec::new();
        for link in &self.links {
            let (Some(&s), Some(&t)) = (pos.get(&link.source), pos.get(&link.target)) else {
                continue;
            };
            arcs.push((s, t));
            if !link.directed {
                arcs.push((t, s));
            }
        }
        let mut out_degree = vec![0usize; n];
        for &(s, _) in &arcs {
            out_degree[s] += 1;
        }

        let nf = n as f64;
        let d = cfg.damping;
        let mut rank = vec![1.0 / nf; n];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < cfg.iterations {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            iterations += 1;

            let dangling: f64 = (0..n).filter(|&i| out_degree[i] == 0).map(|i| rank[i]).sum();
            let mut next = vec![(1.0 - d) / nf + d * dangling / nf; n];
            for &(s, t) in &arcs {
                next[t] += d * rank[s] / out_degree[s] as f64;
            }
            let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
            rank = next;
            if delta < cfg.tolerance {
                converged = true;
                break;
            }
        }

        let mut ranked: Vec<Scored> = ids
            .into_iter()
            .zip(rank)
            .map(|(id, score)| Scored {
                id: id.clone(),
                score,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        Ok(Ranking {
            ranked,
            iterations,
            converged,
            truncated: !converged,
        })
    }

    /// Weakly connected components, largest first; members in id order.
    pub fn components(&self) -> Vec<Vec<ValueId>> {
        let mut adjacent: HashMap<&ValueId, Vec<&ValueId>> = HashMap::new();
        for link in &self.links {
            adjacent.entry(&link.source).or_default().push(&link.target);
            adjacent.entry(&link.target).or_default().push(&link.source);
        }

        let mut assigned: BTreeSet<&ValueId> = BTreeSet::new();
        let mut components = Vec::new();
        for start in &self.nodes {
            if !assigned.insert(start) {
                continue;
            }
            let mut members = vec![start.clone()];
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                for &next in adjacent.get(node).map(Vec::as_slice).unwrap_or(&[]) {
                    if assigned.insert(next) {
                        members.push(next.clone());
                        stack.push(next);
                    }
                }
            }
            members.sort();
            components.push(members);
        }
        components.sort_by(|a: &Vec<ValueId>, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));
        components
    }
}

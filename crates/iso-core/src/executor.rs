//! Runs a compiled plan against one immutable graph snapshot.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::compiler::{ConnectStep, PlanStep, QueryPlan};
use crate::connection::{
    AggregateSpec, Aggregation, Centrality, ConnectionEngine, PathResult, Ranking, Scope,
    Subgraph, Traversal,
};
use crate::error::Result;
use crate::filter::{ConnectionOp, RankAlgorithm};
use crate::graph::Graph;
use crate::separation::{Composition, Group, Population, SeparationEngine, group_ids, order_ids};
use crate::value::{ValueId, ValueKind};

/// Below this many values OR-mode steps run sequentially.
const PARALLEL_THRESHOLD: usize = 4096;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub ids: Vec<ValueId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Group>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionOutput>,
    pub truncated: bool,
}

/// Operation-specific output of the plan's connection step.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionOutput {
    Neighborhood(Traversal),
    Path(PathResult),
    Aggregate(Aggregation),
    Degree { scores: Vec<Centrality> },
    Influence(Ranking),
    Clusters { components: Vec<Vec<ValueId>> },
}

struct Connected {
    reached: BTreeSet<ValueId>,
    output: ConnectionOutput,
    truncated: bool,
}

pub fn execute(graph: &Graph, plan: &QueryPlan, cancel: Option<&CancelToken>) -> Result<QueryResult> {
    let checkpoint = || cancel.map_or(Ok(()), CancelToken::checkpoint);
    let engine = SeparationEngine::new(graph);
    let mut connection = None;
    let mut truncated = false;

    let matched: Option<BTreeSet<ValueId>> = match plan.mode {
        Composition::And => {
            let mut candidates: Option<BTreeSet<ValueId>> = None;
            for step in &plan.steps {
                checkpoint()?;
                let hits = match step {
                    PlanStep::Separate { predicate, .. } => engine.evaluate(predicate),
                    PlanStep::Connect(step) => {
                        let scope = narrowed_scope(graph, candidates.as_ref(), plan.population);
                        let connected = connect(graph, step, scope.scope(), cancel)?;
                        truncated |= connected.truncated;
                        connection = Some(connected.output);
                        connected.reached
                    }
                };
                candidates = Some(match candidates {
                    None => hits,
                    Some(mut c) => {
                        c.retain(|id| hits.contains(id));
                        c
                    }
                });
            }
            candidates
        }
        Composition::Or if plan.steps.is_empty() => None,
        Composition::Or => {
            let predicates: Vec<_> = plan
                .steps
                .iter()
                .filter_map(|s| match s {
                    PlanStep::Separate { predicate, .. } => Some(predicate),
                    PlanStep::Connect(_) => None,
                })
                .collect();

            let mut union = BTreeSet::new();
            if graph.len() >= PARALLEL_THRESHOLD && predicates.len() > 1 {
                let engine = &engine;
                let hits: Vec<BTreeSet<ValueId>> = std::thread::scope(|s| {
                    let handles: Vec<_> = predicates
                        .iter()
                        .map(|p| s.spawn(move || engine.evaluate(p)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                        .collect()
                });
                checkpoint()?;
                for set in hits {
                    union.extend(set);
                }
            } else {
                for predicate in predicates {
                    checkpoint()?;
                    union.extend(engine.evaluate(predicate));
                }
            }

            for step in &plan.steps {
                if let PlanStep::Connect(step) = step {
                    checkpoint()?;
                    let connected = connect(graph, step, Scope::default(), cancel)?;
                    truncated |= connected.truncated;
                    connection = Some(connected.output);
                    union.extend(connected.reached);
                }
            }
            Some(union)
        }
    };

    let admitted: Vec<ValueId> = match matched {
        Some(set) => set
            .into_iter()
            .filter(|id| graph.kind_of(id).is_some_and(|k| plan.population.admits(k)))
            .collect(),
        None => engine.population(plan.population).into_iter().collect(),
    };

    checkpoint()?;
    let ids = order_ids(graph, admitted, plan.order.as_ref());
    let groups = plan.group_by.as_ref().map(|key| group_ids(graph, &ids, key));
    Ok(QueryResult {
        ids,
        groups,
        connection,
        truncated,
    })
}

/// Owned node/edge restriction derived from the AND candidates so far.
struct NarrowedScope {
    nodes: Option<BTreeSet<ValueId>>,
    edges: Option<BTreeSet<ValueId>>,
}

impl NarrowedScope {
    fn scope(&self) -> Scope<'_> {
        Scope {
            nodes: self.nodes.as_ref(),
            edges: self.edges.as_ref(),
        }
    }
}

/// Only kinds the population selects are narrowed: filtering edges by
/// channel must not hide the nodes those edges connect.
fn narrowed_scope(
    graph: &Graph,
    candidates: Option<&BTreeSet<ValueId>>,
    population: Population,
) -> NarrowedScope {
    let Some(candidates) = candidates else {
        return NarrowedScope {
            nodes: None,
            edges: None,
        };
    };
    let of_kind = |kind: ValueKind| -> Option<BTreeSet<ValueId>> {
        population.admits(kind).then(|| {
            candidates
                .iter()
                .filter(|id| graph.kind_of(id) == Some(kind))
                .cloned()
                .collect()
        })
    };
    NarrowedScope {
        nodes: of_kind(ValueKind::Node),
        edges: of_kind(ValueKind::Edge),
    }
}

fn connect(
    graph: &Graph,
    step: &ConnectStep,
    scope: Scope<'_>,
    cancel: Option<&CancelToken>,
) -> Result<Connected> {
    let mut engine = ConnectionEngine::new(graph)
        .direction(step.direction)
        .budget(step.visit_budget)
        .within(scope);
    if let Some(token) = cancel {
        engine = engine.cancel(token);
    }

    let traversal_reach = |t: &Traversal| -> BTreeSet<ValueId> {
        let mut reached = t.node_ids();
        reached.extend(t.edges.iter().cloned());
        reached
    };

    let connected = match &step.operation {
        ConnectionOp::Neighborhood => {
            let t = engine.traverse(&step.seeds, step.depth)?;
            Connected {
                reached: traversal_reach(&t),
                truncated: t.truncated,
                output: ConnectionOutput::Neighborhood(t),
            }
        }
        ConnectionOp::Path { to } => {
            let result = match step.seeds.first() {
                Some(from) => engine.shortest_path(from, to, step.depth)?,
                None => PathResult::default(),
            };
            let mut reached = BTreeSet::new();
            if let Some(path) = &result.path {
                reached.extend(path.nodes.iter().cloned());
                reached.extend(path.edges.iter().cloned());
            }
            Connected {
                reached,
                truncated: result.truncated,
                output: ConnectionOutput::Path(result),
            }
        }
        ConnectionOp::Aggregate { recent, group_by } => {
            let spec = AggregateSpec {
                recent: recent.clone(),
                group_by: group_by.clone(),
            };
            let agg = engine.aggregate(&step.seeds, step.depth, &spec)?;
            let mut reached: BTreeSet<ValueId> = agg.edges.iter().cloned().collect();
            reached.extend(agg.summaries.iter().map(|s| s.node.clone()));
            Connected {
                reached,
                truncated: agg.truncated,
                output: ConnectionOutput::Aggregate(agg),
            }
        }
        ConnectionOp::Rank { algorithm } => {
            let t = engine.traverse(&step.seeds, step.depth)?;
            let sub = Subgraph::from_traversal(graph, &t);
            let (output, rank_truncated) = match algorithm {
                RankAlgorithm::Degree => (
                    ConnectionOutput::Degree {
                        scores: sub.degree_centrality(),
                    },
                    false,
                ),
                RankAlgorithm::Influence => {
                    let ranking = sub.influence_rank(&step.rank, cancel)?;
                    let truncated = ranking.truncated;
                    (ConnectionOutput::Influence(ranking), truncated)
                }
            };
            Connected {
                reached: traversal_reach(&t),
                truncated: t.truncated || rank_truncated,
                output,
            }
        }
        ConnectionOp::Clusters => {
            let t = engine.traverse(&step.seeds, step.depth)?;
            let sub = Subgraph::from_traversal(graph, &t);
            Connected {
                reached: traversal_reach(&t),
                truncated: t.truncated,
                output: ConnectionOutput::Clusters {
                    components: sub.components(),
                },
            }
        }
    };
    Ok(connected)
}

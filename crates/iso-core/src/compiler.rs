//! Filter-state compiler: `FilterState` → executable plan + query text.
//!
//! Pure translation. All validation happens here so the engines never see
//! a contradictory predicate.

use std::cmp::Reverse;
use std::fmt::Write as _;

use serde::Serialize;

use crate::config::{AxisOrder, EngineConfig, RankConfig};
use crate::connection::Direction;
use crate::error::{IsoError, Result};
use crate::facet::FacetValue;
use crate::filter::{AxisFilter, Condition, ConnectionOp, FilterState, LinkQuery, Op, Operand};
use crate::separation::{
    AxisCondition, Composition, GroupKey, Matcher, Pattern, Population, Predicate, SortKey,
    TimeRange,
};
use crate::time::{format_compact, parse_iso8601};
use crate::value::{Axis, GeoPoint, ValueId};

const CONNECT_BASE_COST: u32 = 50;
const CONNECT_DEPTH_COST: u32 = 10;
const CLUSTER_COST: u32 = 20;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryPlan {
    pub population: Population,
    pub mode: Composition,
    pub steps: Vec<PlanStep>,
    pub order: Option<SortKey>,
    pub group_by: Option<GroupKey>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    Separate {
        axis: Axis,
        predicate: Predicate,
        cost: u32,
    },
    Connect(ConnectStep),
}

impl PlanStep {
    pub fn cost(&self) -> u32 {
        match self {
            PlanStep::Separate { cost, .. } => *cost,
            PlanStep::Connect(step) => step.cost,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectStep {
    pub seeds: Vec<ValueId>,
    pub depth: usize,
    pub direction: Direction,
    pub operation: ConnectionOp,
    pub visit_budget: usize,
    pub rank: RankConfig,
    pub cost: u32,
}

pub struct Compiler<'c> {
    config: &'c EngineConfig,
}

impl<'c> Compiler<'c> {
    pub fn new(config: &'c EngineConfig) -> Self {
        Self { config }
    }

    pub fn compile(&self, state: &FilterState) -> Result<CompiledQuery> {
        let mut separate = Vec::new();
        for (axis, filter) in state.active_axes() {
            separate.push(compile_axis(axis, filter)?);
        }
        self.order_steps(&mut separate);

        let mut steps: Vec<PlanStep> = separate.into_iter().map(|s| s.step).collect();
        // Connection runs last: it operates on whatever separation left.
        if let Some(links) = state.links() {
            steps.push(PlanStep::Connect(self.compile_links(links)?));
        }

        if let Some(sort) = &state.sort {
            check_key(sort.axis, &sort.facet, "sort")?;
        }
        if let Some(group) = &state.group_by {
            check_key(group.axis, &group.facet, "group_by")?;
        }

        let plan = QueryPlan {
            population: state.population,
            mode: state.mode,
            steps,
            order: state.sort.clone(),
            group_by: state.group_by.clone(),
        };
        let text = render(&plan);
        Ok(CompiledQuery { plan, text })
    }

    fn order_steps(&self, steps: &mut [CompiledAxis]) {
        let heuristic = |s: &CompiledAxis| (s.step.cost(), Reverse(s.conditions), s.axis);
        match &self.config.compiler.order {
            AxisOrder::Heuristic => steps.sort_by_key(heuristic),
            AxisOrder::Fixed(listed) => steps.sort_by_key(|s| {
                let slot = listed
                    .iter()
                    .position(|a| *a == s.axis)
                    .unwrap_or(listed.len());
                (slot, heuristic(s))
            }),
        }
    }

    fn compile_links(&self, links: &LinkQuery) -> Result<ConnectStep> {
        let location = "relational.links";
        let max_depth = self.config.traversal.max_depth;
        if links.depth > max_depth {
            return Err(IsoError::malformed(
                location,
                format!("depth {} exceeds the maximum of {max_depth}", links.depth),
            ));
        }
        let mut extra = 0;
        match &links.operation {
            ConnectionOp::Path { to } => {
                if links.seeds.len() > 1 {
                    return Err(IsoError::malformed(
                        location,
                        format!("path needs one seed, got {}", links.seeds.len()),
                    ));
                }
                if to.as_str().is_empty() {
                    return Err(IsoError::malformed(location, "path target is empty"));
                }
            }
            ConnectionOp::Rank { .. } | ConnectionOp::Clusters => {
                if self.config.rank.iterations == 0 {
                    return Err(IsoError::malformed(location, "rank iterations must be positive"));
                }
                extra = CLUSTER_COST;
            }
            ConnectionOp::Aggregate { recent, group_by } => {
                if let Some(recent) = recent {
                    check_key(recent.order.axis, &recent.order.facet, "relational.links.recent")?;
                }
                if let Some(group) = group_by {
                    check_key(group.axis, &group.facet, "relational.links.group_by")?;
                }
            }
            ConnectionOp::Neighborhood => {}
        }
        Ok(ConnectStep {
            seeds: links.seeds.clone(),
            depth: links.depth,
            direction: links.direction,
            operation: links.operation.clone(),
            visit_budget: self.config.traversal.visit_budget,
            rank: self.config.rank.clone(),
            cost: CONNECT_BASE_COST + CONNECT_DEPTH_COST * links.depth as u32 + extra,
        })
    }
}

struct CompiledAxis {
    axis: Axis,
    conditions: usize,
    step: PlanStep,
}

fn check_key(axis: Axis, facet: &str, location: &str) -> Result<()> {
    if facet.trim().is_empty() {
        return Err(IsoError::malformed(
            location,
            format!("{axis} key has an empty facet name"),
        ));
    }
    Ok(())
}

fn compile_axis(axis: Axis, filter: &AxisFilter) -> Result<CompiledAxis> {
    let mut parts = Vec::with_capacity(filter.conditions.len());
    let mut costs = Vec::with_capacity(filter.conditions.len());
    for (i, cond) in filter.conditions.iter().enumerate() {
        let location = match &cond.facet {
            Some(name) => format!("{axis}[{i}] ({name})"),
            None => format!("{axis}[{i}]"),
        };
        let (matcher, cost) = compile_condition(axis, cond, &location)?;
        parts.push(Predicate::Condition(AxisCondition {
            axis,
            facet: cond.facet.clone(),
            matcher,
        }));
        costs.push(cost);
    }

    let cost = match filter.mode {
        Composition::And => costs.iter().copied().min().unwrap_or(0),
        Composition::Or => costs.iter().sum(),
    };
    let predicate = if parts.len() == 1 {
        parts.remove(0)
    } else {
        Predicate::compose(filter.mode, parts)
    };
    Ok(CompiledAxis {
        axis,
        conditions: filter.conditions.len(),
        step: PlanStep::Separate {
            axis,
            predicate,
            cost,
        },
    })
}

fn compile_condition(axis: Axis, cond: &Condition, location: &str) -> Result<(Matcher, u32)> {
    if let Some(name) = &cond.facet
        && name.trim().is_empty()
    {
        return Err(IsoError::malformed(location, "empty facet name"));
    }
    let mismatch = || {
        IsoError::malformed(
            location,
            format!("operator {} does not apply to the {axis} axis", cond.op.name()),
        )
    };

    match &cond.op {
        Op::Equals { value } => Ok((
            Matcher::Equals {
                value: convert(axis, value, location)?,
            },
            1,
        )),
        Op::Range { min, max } => {
            if axis == Axis::Spatial {
                return Err(mismatch());
            }
            if min.is_none() && max.is_none() {
                return Err(IsoError::malformed(location, "range has neither min nor max"));
            }
            let min = min.as_ref().map(|v| convert(axis, v, location)).transpose()?;
            let max = max.as_ref().map(|v| convert(axis, v, location)).transpose()?;
            if let (Some(lo), Some(hi)) = (&min, &max) {
                if !lo.same_type(hi) {
                    return Err(IsoError::malformed(location, "range bounds differ in type"));
                }
                if lo > hi {
                    return Err(IsoError::malformed(location, format!("min {lo} is above max {hi}")));
                }
            }
            Ok((Matcher::Range { min, max }, 2))
        }
        Op::Contains { text } => {
            if matches!(axis, Axis::Temporal | Axis::Ordinal) {
                return Err(mismatch());
            }
            if text.is_empty() {
                return Err(IsoError::malformed(location, "empty search text"));
            }
            Ok((
                Matcher::Contains {
                    needle: text.to_lowercase(),
                },
                5,
            ))
        }
        Op::Regex { pattern } => {
            if matches!(axis, Axis::Temporal | Axis::Ordinal) {
                return Err(mismatch());
            }
            let pattern = Pattern::new(pattern)
                .map_err(|e| IsoError::malformed(location, format!("invalid regex: {e}")))?;
            Ok((Matcher::Regex { pattern }, 6))
        }
        Op::During { ranges } => {
            if axis != Axis::Temporal {
                return Err(mismatch());
            }
            if ranges.is_empty() {
                return Err(IsoError::malformed(location, "empty range set"));
            }
            for (i, r) in ranges.iter().enumerate() {
                if r.start > r.end {
                    return Err(IsoError::malformed(
                        location,
                        format!(
                            "range {i} starts after it ends ({} > {})",
                            format_compact(r.start),
                            format_compact(r.end)
                        ),
                    ));
                }
            }
            Ok((
                Matcher::During {
                    ranges: normalize_ranges(ranges),
                },
                2,
            ))
        }
        Op::Near {
            lat,
            lon,
            radius_km,
        } => {
            if axis != Axis::Spatial {
                return Err(mismatch());
            }
            let center = GeoPoint::new(*lat, *lon);
            if !center.is_valid() {
                return Err(IsoError::malformed(
                    location,
                    format!("coordinates out of range: ({lat}, {lon})"),
                ));
            }
            if !radius_km.is_finite() || *radius_km < 0.0 {
                return Err(IsoError::malformed(
                    location,
                    format!("radius {radius_km} km is not a non-negative distance"),
                ));
            }
            Ok((
                Matcher::Near {
                    center,
                    radius_km: *radius_km,
                },
                4,
            ))
        }
    }
}

/// Convert a UI literal to the facet type the axis stores. Mirrors the
/// coercions of facet derivation so equality can actually hit.
fn convert(axis: Axis, operand: &Operand, location: &str) -> Result<FacetValue> {
    let bad = |what: &str| {
        IsoError::malformed(location, format!("{what} is not a valid {axis} operand"))
    };
    match (axis, operand) {
        (Axis::Spatial | Axis::Relational, Operand::Text(s)) => Ok(FacetValue::Text(s.clone())),
        (Axis::Lexical, Operand::Text(s)) => Ok(FacetValue::Text(s.clone())),
        (Axis::Lexical, Operand::Number(n)) => Ok(FacetValue::Text(n.to_string())),
        (Axis::Temporal, Operand::Text(s)) => parse_iso8601(s)
            .map(FacetValue::Time)
            .ok_or_else(|| bad(&format!("'{s}'"))),
        (Axis::Temporal, Operand::Number(n)) if n.fract() == 0.0 && n.is_finite() => {
            Ok(FacetValue::Time(*n as i64))
        }
        (Axis::Categorical, Operand::Text(s)) => Ok(FacetValue::Text(s.clone())),
        (Axis::Categorical, Operand::Bool(b)) => Ok(FacetValue::Bool(*b)),
        (Axis::Categorical, Operand::Number(n)) => Ok(FacetValue::number(*n)),
        (Axis::Ordinal, Operand::Number(n)) if !n.is_nan() => Ok(FacetValue::number(*n)),
        (Axis::Ordinal, Operand::Text(s)) => match s.trim().parse::<f64>() {
            Ok(n) if !n.is_nan() => Ok(FacetValue::number(n)),
            _ => Err(bad(&format!("'{s}'"))),
        },
        (_, Operand::Bool(b)) => Err(bad(&b.to_string())),
        (_, Operand::Number(n)) => Err(bad(&n.to_string())),
        (_, Operand::Text(s)) => Err(bad(&format!("'{s}'"))),
    }
}

/// Sort and coalesce overlapping or touching ranges. The result is still a
/// set of disjoint ranges.
pub fn normalize_ranges(ranges: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted: Vec<TimeRange> = ranges.to_vec();
    sorted.sort();
    let mut out: Vec<TimeRange> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match out.last_mut() {
            Some(last) if r.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(r.end);
            }
            _ => out.push(r),
        }
    }
    out
}

/// Render the plan as the expert-surface query string.
pub fn render(plan: &QueryPlan) -> String {
    let subject = match plan.population {
        Population::Nodes => "nodes",
        Population::Edges => "edges",
        Population::Both => "values",
    };
    let mut out = format!("FIND {subject}");
    for (i, step) in plan.steps.iter().enumerate() {
        let lead = if i == 0 {
            "\nWHERE ".to_string()
        } else {
            format!("\n  {} ", plan.mode.keyword())
        };
        out.push_str(&lead);
        match step {
            PlanStep::Separate { predicate, .. } => render_predicate(&mut out, predicate, true),
            PlanStep::Connect(step) => render_connect(&mut out, step),
        }
    }
    if let Some(sort) = &plan.order {
        let _ = write!(out, "\nORDER BY {}.{}", sort.axis, sort.facet);
        if sort.descending {
            out.push_str(" DESC");
        }
    }
    if let Some(group) = &plan.group_by {
        let _ = write!(out, "\nGROUP BY {}.{}", group.axis, group.facet);
    }
    out
}

fn render_predicate(out: &mut String, predicate: &Predicate, top: bool) {
    match predicate {
        Predicate::Condition(cond) => render_condition(out, cond),
        Predicate::All(parts) | Predicate::Any(parts) => {
            let joiner = if matches!(predicate, Predicate::All(_)) {
                " AND "
            } else {
                " OR "
            };
            let wrap = !top || parts.len() > 1;
            if wrap {
                out.push('(');
            }
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    out.push_str(joiner);
                }
                render_predicate(out, part, false);
            }
            if wrap {
                out.push(')');
            }
        }
    }
}

fn render_condition(out: &mut String, cond: &AxisCondition) {
    let facet = cond.facet.as_deref().unwrap_or("*");
    let _ = write!(out, "{}.{facet} ", cond.axis);
    match &cond.matcher {
        Matcher::Equals { value } => {
            out.push_str("= ");
            render_literal(out, value);
        }
        Matcher::Range { min, max } => {
            out.push_str("IN [");
            match min {
                Some(v) => render_literal(out, v),
                None => out.push('*'),
            }
            out.push_str(" .. ");
            match max {
                Some(v) => render_literal(out, v),
                None => out.push('*'),
            }
            out.push(']');
        }
        Matcher::Contains { needle } => {
            let _ = write!(out, "CONTAINS {needle:?}");
        }
        Matcher::Regex { pattern } => {
            let _ = write!(out, "MATCHES /{}/", pattern.as_str());
        }
        Matcher::During { ranges } => {
            out.push_str("DURING [");
            for (i, r) in ranges.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(
                    out,
                    "{:?} .. {:?}",
                    format_compact(r.start),
                    format_compact(r.end)
                );
            }
            out.push(']');
        }
        Matcher::Near { center, radius_km } => {
            let _ = write!(
                out,
                "NEAR ({}, {}) WITHIN {radius_km}km",
                center.lat, center.lon
            );
        }
    }
}

fn render_literal(out: &mut String, value: &FacetValue) {
    let _ = match value {
        FacetValue::Text(s) => write!(out, "{s:?}"),
        FacetValue::Time(t) => write!(out, "{:?}", format_compact(*t)),
        other => write!(out, "{other}"),
    };
}

fn render_connect(out: &mut String, step: &ConnectStep) {
    let seeds: Vec<String> = step.seeds.iter().map(|s| format!("{:?}", s.as_str())).collect();
    let _ = write!(
        out,
        "LINKED FROM [{}] DEPTH {} {}",
        seeds.join(", "),
        step.depth,
        step.direction.keyword()
    );
    match &step.operation {
        ConnectionOp::Neighborhood => {}
        ConnectionOp::Path { to } => {
            let _ = write!(out, " PATH TO {:?}", to.as_str());
        }
        ConnectionOp::Aggregate { recent, group_by } => {
            out.push_str(" AGGREGATE");
            if let Some(r) = recent {
                let _ = write!(out, " RECENT {} BY {}.{}", r.limit, r.order.axis, r.order.facet);
                if r.order.descending {
                    out.push_str(" DESC");
                }
            }
            if let Some(g) = group_by {
                let _ = write!(out, " COUNT BY {}.{}", g.axis, g.facet);
            }
        }
        ConnectionOp::Rank { algorithm } => {
            let name = match algorithm {
                crate::filter::RankAlgorithm::Degree => "DEGREE",
                crate::filter::RankAlgorithm::Influence => "INFLUENCE",
            };
            let _ = write!(out, " RANK {name}");
        }
        ConnectionOp::Clusters => out.push_str(" CLUSTERS"),
    }
}

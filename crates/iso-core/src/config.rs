//! Engine tunables. Every field has a default so partial config files work.

use serde::{Deserialize, Serialize};

use crate::value::Axis;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub traversal: TraversalConfig,
    pub rank: RankConfig,
    pub compiler: CompilerConfig,
    pub replay: ReplayConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Maximum values visited by one traversal before it reports truncation.
    pub visit_budget: usize,
    /// Largest depth a filter state may request.
    pub max_depth: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            visit_budget: 10_000,
            max_depth: 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    pub iterations: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            iterations: 50,
            damping: 0.85,
            tolerance: 1e-6,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub order: AxisOrder,
}

/// Evaluation order of the separation axes in a compiled plan.
///
/// Written as `"heuristic"` or as a list of axis names; listed axes go
/// first, the rest follow in heuristic order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisOrderRepr", into = "AxisOrderRepr")]
pub enum AxisOrder {
    #[default]
    Heuristic,
    Fixed(Vec<Axis>),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AxisOrderRepr {
    Named(String),
    Axes(Vec<Axis>),
}

impl TryFrom<AxisOrderRepr> for AxisOrder {
    type Error = String;

    fn try_from(repr: AxisOrderRepr) -> Result<Self, Self::Error> {
        match repr {
            AxisOrderRepr::Named(name) if name == "heuristic" => Ok(AxisOrder::Heuristic),
            AxisOrderRepr::Named(name) => Err(format!(
                "unknown axis order '{name}' (expected \"heuristic\" or a list of axes)"
            )),
            AxisOrderRepr::Axes(axes) => {
                let mut seen = Vec::new();
                for axis in axes {
                    if seen.contains(&axis) {
                        return Err(format!("axis {axis} listed twice in axis order"));
                    }
                    seen.push(axis);
                }
                Ok(AxisOrder::Fixed(seen))
            }
        }
    }
}

impl From<AxisOrder> for AxisOrderRepr {
    fn from(order: AxisOrder) -> Self {
        match order {
            AxisOrder::Heuristic => AxisOrderRepr::Named("heuristic".to_string()),
            AxisOrder::Fixed(axes) => AxisOrderRepr::Axes(axes),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Delay between frames at speed 1.0.
    pub interval_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"traversal": {"max_depth": 3}}"#).unwrap();
        assert_eq!(cfg.traversal.max_depth, 3);
        assert_eq!(cfg.traversal.visit_budget, 10_000);
        assert_eq!(cfg.rank, RankConfig::default());
        assert_eq!(cfg.compiler.order, AxisOrder::Heuristic);
    }

    #[test]
    fn test_axis_order_forms() {
        let cfg: CompilerConfig =
            serde_json::from_str(r#"{"order": ["temporal", "categorical"]}"#).unwrap();
        assert_eq!(
            cfg.order,
            AxisOrder::Fixed(vec![Axis::Temporal, Axis::Categorical])
        );
        let back = serde_json::to_string(&cfg).unwrap();
        assert_eq!(back, r#"{"order":["temporal","categorical"]}"#);

        assert!(serde_json::from_str::<CompilerConfig>(r#"{"order": "fastest"}"#).is_err());
        assert!(
            serde_json::from_str::<CompilerConfig>(r#"{"order": ["lexical", "lexical"]}"#)
                .is_err()
        );
    }
}

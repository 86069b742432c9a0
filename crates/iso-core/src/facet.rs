//! Facets: attributes projected onto axes.
//!
//! Facets are never written directly. `derive_facets` is the single source
//! of truth and every store write goes through it.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IsoError, Result};
use crate::time::{format_compact, parse_iso8601};
use crate::value::{AttrValue, Attribute, Axis, GeoPoint, Value, ValueId};

/// Built-in relational facet names carried by every edge.
pub const SOURCE_FACET: &str = "source";
pub const TARGET_FACET: &str = "target";

/// Typed, totally ordered facet payload.
///
/// Ordering is axis-aware by construction: text uses case-insensitive
/// collation (raw bytes break ties), numbers are rank order, times are
/// chronological. Variants of different types order by variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FacetValue {
    Bool(bool),
    Number(f64),
    Time(i64),
    Text(String),
    Point(GeoPoint),
}

impl FacetValue {
    pub fn text(s: impl Into<String>) -> Self {
        FacetValue::Text(s.into())
    }

    /// Numeric facet with `-0.0` folded into `0.0`, so equality matches
    /// both zeros under the total order.
    pub fn number(n: f64) -> Self {
        FacetValue::Number(if n == 0.0 { 0.0 } else { n })
    }

    fn rank(&self) -> u8 {
        match self {
            FacetValue::Bool(_) => 0,
            FacetValue::Number(_) => 1,
            FacetValue::Time(_) => 2,
            FacetValue::Text(_) => 3,
            FacetValue::Point(_) => 4,
        }
    }

    pub fn same_type(&self, other: &FacetValue) -> bool {
        self.rank() == other.rank()
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FacetValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<i64> {
        match self {
            FacetValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// Case-insensitive collation with a byte-wise tiebreak.
pub fn collate(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

impl Ord for FacetValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FacetValue::Bool(a), FacetValue::Bool(b)) => a.cmp(b),
            (FacetValue::Number(a), FacetValue::Number(b)) => a.total_cmp(b),
            (FacetValue::Time(a), FacetValue::Time(b)) => a.cmp(b),
            (FacetValue::Text(a), FacetValue::Text(b)) => collate(a, b),
            (FacetValue::Point(a), FacetValue::Point(b)) => a
                .lat
                .total_cmp(&b.lat)
                .then_with(|| a.lon.total_cmp(&b.lon)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for FacetValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FacetValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FacetValue {}

impl fmt::Display for FacetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacetValue::Bool(b) => write!(f, "{b}"),
            FacetValue::Number(n) => write!(f, "{n}"),
            FacetValue::Time(t) => f.write_str(&format_compact(*t)),
            FacetValue::Text(s) => f.write_str(s),
            FacetValue::Point(p) => write!(f, "({}, {})", p.lat, p.lon),
        }
    }
}

/// One `(value_id, axis, name, value)` tuple.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Facet {
    pub value_id: ValueId,
    pub axis: Axis,
    pub name: String,
    pub value: FacetValue,
}

/// Project a value's attributes onto facets.
///
/// Output is sorted and deduplicated so two derivations of the same value
/// compare equal. Fails if an attribute cannot live on its declared axis;
/// callers must treat that as a rejected write.
pub fn derive_facets(value: &Value) -> Result<Vec<Facet>> {
    let mut facets = Vec::new();

    for (name, attr) in &value.attributes {
        let axis = attr.axis();
        for fv in classify(value, name, attr)? {
            facets.push(Facet {
                value_id: value.id.clone(),
                axis,
                name: name.clone(),
                value: fv,
            });
        }
    }

    if let Some(link) = &value.link {
        for (name, endpoint) in [(SOURCE_FACET, &link.source), (TARGET_FACET, &link.target)] {
            facets.push(Facet {
                value_id: value.id.clone(),
                axis: Axis::Relational,
                name: name.to_string(),
                value: FacetValue::Text(endpoint.to_string()),
            });
        }
    }

    facets.sort();
    facets.dedup();
    Ok(facets)
}

fn classify(value: &Value, name: &str, attr: &Attribute) -> Result<Vec<FacetValue>> {
    let axis = attr.axis();
    let reject = |reason: String| IsoError::FacetDerivation {
        id: value.id.clone(),
        attribute: name.to_string(),
        reason,
    };
    let mismatch = || {
        reject(format!(
            "{} payload cannot be classified as {axis}",
            attr.value.type_name()
        ))
    };
    let texts = |tags: &[String]| tags.iter().map(|t| FacetValue::Text(t.clone())).collect();

    let out = match (axis, &attr.value) {
        (Axis::Spatial, AttrValue::Location(p)) => {
            if !p.is_valid() {
                return Err(reject(format!("coordinates out of range: ({}, {})", p.lat, p.lon)));
            }
            vec![FacetValue::Point(*p)]
        }
        (Axis::Spatial, AttrValue::Text(s)) => vec![FacetValue::Text(s.clone())],
        (Axis::Spatial, AttrValue::Tags(tags)) => texts(tags),

        (Axis::Lexical, AttrValue::Text(s)) => vec![FacetValue::Text(s.clone())],
        (Axis::Lexical, AttrValue::Tags(tags)) => texts(tags),
        (Axis::Lexical, AttrValue::Number(n)) => vec![FacetValue::Text(n.to_string())],

        (Axis::Temporal, AttrValue::Number(n)) => {
            if n.fract() != 0.0 || !n.is_finite() {
                return Err(reject(format!("{n} is not a whole number of seconds")));
            }
            vec![FacetValue::Time(*n as i64)]
        }
        (Axis::Temporal, AttrValue::Text(s)) => match parse_iso8601(s) {
            Some(t) => vec![FacetValue::Time(t)],
            None => return Err(reject(format!("'{s}' is not an ISO-8601 date"))),
        },

        (Axis::Categorical, AttrValue::Text(s)) => vec![FacetValue::Text(s.clone())],
        (Axis::Categorical, AttrValue::Tags(tags)) => texts(tags),
        (Axis::Categorical, AttrValue::Bool(b)) => vec![FacetValue::Bool(*b)],
        (Axis::Categorical, AttrValue::Number(n)) => vec![FacetValue::number(*n)],

        (Axis::Ordinal, AttrValue::Number(n)) => {
            if n.is_nan() {
                return Err(reject("rank is NaN".to_string()));
            }
            vec![FacetValue::number(*n)]
        }
        (Axis::Ordinal, AttrValue::Text(s)) => match s.trim().parse::<f64>() {
            Ok(n) if !n.is_nan() => vec![FacetValue::number(n)],
            _ => return Err(reject(format!("'{s}' is not a numeric rank"))),
        },

        (Axis::Relational, AttrValue::Text(s)) => vec![FacetValue::Text(s.clone())],
        (Axis::Relational, AttrValue::Tags(tags)) => texts(tags),

        _ => return Err(mismatch()),
    };
    Ok(out)
}

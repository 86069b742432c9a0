use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IsoError, Result};

/// Stable identifier of a Value. Import adapters usually bring their own
/// (`"alice"`, `"msg-2291"`); `ValueId::generate` mints a UUID otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(String);

impl ValueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ValueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ValueId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Node or edge. Immutable once a value has been stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Node,
    Edge,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Node => "node",
            ValueKind::Edge => "edge",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "node" => Ok(ValueKind::Node),
            "edge" => Ok(ValueKind::Edge),
            other => Err(format!("unknown value kind: {other}")),
        }
    }
}

/// Organizing dimension an attribute is classified onto.
///
/// Declaration order is the canonical order (location, alphabet, time,
/// category, hierarchy, then links); derived `Ord` relies on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Spatial,
    Lexical,
    Temporal,
    Categorical,
    Ordinal,
    Relational,
}

impl Axis {
    pub const ALL: [Axis; 6] = [
        Axis::Spatial,
        Axis::Lexical,
        Axis::Temporal,
        Axis::Categorical,
        Axis::Ordinal,
        Axis::Relational,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Axis::Spatial => "spatial",
            Axis::Lexical => "lexical",
            Axis::Temporal => "temporal",
            Axis::Categorical => "categorical",
            Axis::Ordinal => "ordinal",
            Axis::Relational => "relational",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spatial" | "location" => Ok(Axis::Spatial),
            "lexical" | "alphabet" => Ok(Axis::Lexical),
            "temporal" | "time" => Ok(Axis::Temporal),
            "categorical" | "category" => Ok(Axis::Categorical),
            "ordinal" | "hierarchy" | "rank" => Ok(Axis::Ordinal),
            "relational" | "links" => Ok(Axis::Relational),
            other => Err(format!("unknown axis: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0088;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Raw attribute payload as written by import code or the user.
///
/// Interpretation is deferred to facet derivation: a number classified
/// temporal is Unix seconds, a string classified temporal must parse as an
/// ISO-8601 date.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Tags(Vec<String>),
    Location(GeoPoint),
}

impl AttrValue {
    /// Axis used when the writer did not classify the attribute.
    pub fn default_axis(&self) -> Axis {
        match self {
            AttrValue::Bool(_) | AttrValue::Tags(_) => Axis::Categorical,
            AttrValue::Number(_) => Axis::Ordinal,
            AttrValue::Text(_) => Axis::Lexical,
            AttrValue::Location(_) => Axis::Spatial,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Number(_) => "number",
            AttrValue::Text(_) => "text",
            AttrValue::Tags(_) => "tags",
            AttrValue::Location(_) => "location",
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        AttrValue::Number(n)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Number(n as f64)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<GeoPoint> for AttrValue {
    fn from(p: GeoPoint) -> Self {
        AttrValue::Location(p)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: AttrValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<Axis>,
}

impl Attribute {
    pub fn axis(&self) -> Axis {
        self.axis.unwrap_or_else(|| self.value.default_axis())
    }
}

/// Endpoints of an edge value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source: ValueId,
    pub target: ValueId,
    #[serde(default = "directed_default")]
    pub directed: bool,
}

fn directed_default() -> bool {
    true
}

/// The atomic unit: a node or an edge with typed, axis-classified attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,
    /// Unix seconds. Zero on a fresh value means "stamp on first put".
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub modified_at: i64,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl Value {
    pub fn node(id: impl Into<ValueId>) -> Self {
        Self {
            id: id.into(),
            kind: ValueKind::Node,
            link: None,
            created_at: 0,
            modified_at: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn edge(
        id: impl Into<ValueId>,
        source: impl Into<ValueId>,
        target: impl Into<ValueId>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ValueKind::Edge,
            link: Some(Link {
                source: source.into(),
                target: target.into(),
                directed: true,
            }),
            created_at: 0,
            modified_at: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// Attribute classified by its payload type.
    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(
            name.to_string(),
            Attribute {
                value: value.into(),
                axis: None,
            },
        );
        self
    }

    /// Attribute explicitly classified onto `axis`.
    pub fn with_axis_attr(mut self, name: &str, axis: Axis, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(
            name.to_string(),
            Attribute {
                value: value.into(),
                axis: Some(axis),
            },
        );
        self
    }

    pub fn with_tags(self, name: &str, tags: &[&str]) -> Self {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.with_attr(name, AttrValue::Tags(tags))
    }

    pub fn undirected(mut self) -> Self {
        if let Some(link) = self.link.as_mut() {
            link.directed = false;
        }
        self
    }

    pub fn is_edge(&self) -> bool {
        self.kind == ValueKind::Edge
    }

    /// Human label: `name`, then `title`, then the id.
    pub fn label(&self) -> String {
        ["name", "title", "subject"]
            .iter()
            .find_map(|key| match self.attributes.get(*key).map(|a| &a.value) {
                Some(AttrValue::Text(s)) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Structural checks independent of any store contents.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| IsoError::InvalidValue {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.as_str().trim().is_empty() {
            return Err(invalid("identifier must not be empty"));
        }
        match (self.kind, &self.link) {
            (ValueKind::Edge, None) => Err(invalid("edge without source/target")),
            (ValueKind::Node, Some(_)) => Err(invalid("node must not carry a link")),
            (ValueKind::Edge, Some(link)) if link.source.as_str().is_empty() => {
                Err(invalid("edge source is empty"))
            }
            (ValueKind::Edge, Some(link)) if link.target.as_str().is_empty() => {
                Err(invalid("edge target is empty"))
            }
            _ => Ok(()),
        }
    }
}

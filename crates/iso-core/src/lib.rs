//! Isometry value-graph engine.
//!
//! Everything is a Value (node or edge) whose attributes are classified
//! onto six axes. Separation filters, sorts and groups over those facets;
//! connection follows edges from seed nodes. A serializable filter state
//! compiles to a plan plus query text, and filter states are versioned in
//! branches that can be merged and replayed.
//!
//! Zero I/O: persistence and transport live in other crates.

pub mod cancel;
pub mod compiler;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod facet;
pub mod filter;
pub mod graph;
pub mod history;
pub mod projection;
pub mod replay;
pub mod separation;
pub mod time;
pub mod value;
pub mod wire;

pub use cancel::CancelToken;
pub use compiler::{CompiledQuery, Compiler, ConnectStep, PlanStep, QueryPlan};
pub use config::{AxisOrder, EngineConfig, RankConfig, ReplayConfig, TraversalConfig};
pub use connection::{
    AggregateSpec, Aggregation, ConnectionEngine, Direction, NodeSummary, PathResult, Ranking,
    RecentSpec, Scope, Subgraph, Traversal,
};
pub use error::{IsoError, Result};
pub use executor::{ConnectionOutput, QueryResult, execute};
pub use facet::{Facet, FacetValue, derive_facets};
pub use filter::{
    AxisFilter, Condition, ConnectionOp, FilterState, LinkQuery, Op, Operand, RankAlgorithm,
    RelationalFilter,
};
pub use graph::{FacetIndex, FacetKey, Graph};
pub use history::{Branch, History, MAIN_BRANCH, MergeConflict, MergeOutcome, Snapshot};
pub use projection::{Bucket, Projection, View, ViewKind, project};
pub use replay::{Frame, Pacer, Replay, ReplayOutcome, ThreadPacer};
pub use separation::{
    Composition, GroupKey, Matcher, Population, Predicate, SeparationEngine, SeparationQuery,
    SeparationResult, SortKey, TimeRange,
};
pub use value::{AttrValue, Attribute, Axis, GeoPoint, Link, Value, ValueId, ValueKind};
pub use wire::{CURRENT_VERSION, export_history, import_history, parse_values};

//! JSON wire formats: value batches and history documents.
//!
//! History documents use camelCase field names and carry a `version`;
//! timestamps are ISO-8601 strings. Filter states are embedded in their
//! canonical form.

use serde::{Deserialize, Serialize};

use crate::error::{IsoError, Result};
use crate::filter::FilterState;
use crate::history::{Branch, History, Snapshot};
use crate::time::{now_iso8601, parse_iso8601, unix_to_iso8601};
use crate::value::Value;

pub const CURRENT_VERSION: &str = "1";

#[derive(Serialize, Deserialize, Debug)]
pub struct WireHistory {
    pub version: String,
    #[serde(rename = "exportedAt", default)]
    pub exported_at: String,
    #[serde(rename = "currentBranch")]
    pub current_branch: String,
    pub branches: Vec<WireBranch>,
    pub snapshots: Vec<WireSnapshot>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireBranch {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(rename = "forkPoint", default)]
    pub fork_point: usize,
    pub snapshots: Vec<u64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireSnapshot {
    pub index: u64,
    pub branch: String,
    #[serde(rename = "capturedAt")]
    pub captured_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "filterState")]
    pub filter_state: FilterState,
}

impl WireHistory {
    pub fn from_history(history: &History) -> Self {
        WireHistory {
            version: CURRENT_VERSION.to_string(),
            exported_at: now_iso8601(),
            current_branch: history.current().to_string(),
            branches: history
                .branches()
                .map(|b| WireBranch {
                    name: b.name.clone(),
                    parent: b.parent.clone(),
                    fork_point: b.base,
                    snapshots: b.snapshots.clone(),
                })
                .collect(),
            snapshots: history
                .snapshots()
                .map(|s| WireSnapshot {
                    index: s.index,
                    branch: s.branch.clone(),
                    captured_at: unix_to_iso8601(s.captured_at),
                    label: s.label.clone(),
                    filter_state: s.state.clone(),
                })
                .collect(),
        }
    }

    pub fn into_history(self) -> Result<History> {
        if self.version != CURRENT_VERSION {
            return Err(IsoError::InvalidArgument(format!(
                "unsupported history version {} (expected {CURRENT_VERSION})",
                self.version
            )));
        }
        let branches = self
            .branches
            .into_iter()
            .map(|b| Branch {
                name: b.name,
                parent: b.parent,
                base: b.fork_point,
                snapshots: b.snapshots,
            })
            .collect();
        let snapshots = self
            .snapshots
            .into_iter()
            .map(|s| {
                let captured_at = parse_iso8601(&s.captured_at).ok_or_else(|| {
                    IsoError::InvalidArgument(format!(
                        "snapshot #{} has an invalid capturedAt: {}",
                        s.index, s.captured_at
                    ))
                })?;
                Ok(Snapshot {
                    index: s.index,
                    branch: s.branch,
                    captured_at,
                    label: s.label,
                    state: s.filter_state,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        History::from_parts(branches, snapshots, self.current_branch)
    }
}

pub fn export_history(history: &History) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&WireHistory::from_history(history))
}

pub fn import_history(json: &str) -> Result<History> {
    let wire: WireHistory = serde_json::from_str(json)
        .map_err(|e| IsoError::InvalidArgument(format!("history document: {e}")))?;
    wire.into_history()
}

/// A value batch is either a bare array or `{"values": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ValueBatch {
    Bare(Vec<Value>),
    Wrapped { values: Vec<Value> },
}

pub fn parse_values(json: &str) -> std::result::Result<Vec<Value>, serde_json::Error> {
    Ok(match serde_json::from_str(json)? {
        ValueBatch::Bare(values) | ValueBatch::Wrapped { values } => values,
    })
}

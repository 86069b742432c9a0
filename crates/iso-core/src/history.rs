//! Version control over filter states.
//!
//! Branches are append-only logs of snapshot indices with a recorded fork
//! point into their parent's lineage. Snapshots hold filter states only;
//! the value store is never copied.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{IsoError, Result};
use crate::filter::FilterState;
use crate::time::now_unix_secs;

pub const MAIN_BRANCH: &str = "main";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonic across all branches; never reused.
    pub index: u64,
    /// Branch the snapshot currently belongs to.
    pub branch: String,
    pub captured_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: FilterState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub parent: Option<String>,
    /// Length of the parent's lineage when this branch forked.
    pub base: usize,
    /// Own snapshots, oldest first.
    pub snapshots: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergeConflict {
    pub branch: String,
    pub parent: String,
    pub base: usize,
    /// Captured on the parent after the fork.
    pub parent_snapshots: Vec<u64>,
    /// Captured on the branch.
    pub branch_snapshots: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    FastForward { into: String, transferred: Vec<u64> },
    Conflict(MergeConflict),
}

#[derive(Clone, Debug)]
pub struct History {
    branches: BTreeMap<String, Branch>,
    snapshots: BTreeMap<u64, Snapshot>,
    current: String,
    next_index: u64,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        let main = Branch {
            name: MAIN_BRANCH.to_string(),
            parent: None,
            base: 0,
            snapshots: Vec::new(),
        };
        Self {
            branches: BTreeMap::from([(MAIN_BRANCH.to_string(), main)]),
            snapshots: BTreeMap::new(),
            current: MAIN_BRANCH.to_string(),
            next_index: 1,
        }
    }

    /// Reassemble from persisted parts, checking cross references.
    pub fn from_parts(
        branches: Vec<Branch>,
        snapshots: Vec<Snapshot>,
        current: String,
    ) -> Result<Self> {
        let branches: BTreeMap<String, Branch> =
            branches.into_iter().map(|b| (b.name.clone(), b)).collect();
        let snapshots: BTreeMap<u64, Snapshot> =
            snapshots.into_iter().map(|s| (s.index, s)).collect();

        if !branches.contains_key(MAIN_BRANCH) {
            return Err(IsoError::BranchNotFound(MAIN_BRANCH.to_string()));
        }
        if !branches.contains_key(&current) {
            return Err(IsoError::BranchNotFound(current));
        }
        for branch in branches.values() {
            if let Some(parent) = &branch.parent
                && !branches.contains_key(parent)
            {
                return Err(IsoError::BranchNotFound(parent.clone()));
            }
            for index in &branch.snapshots {
                if !snapshots.contains_key(index) {
                    return Err(IsoError::SnapshotNotFound {
                        branch: branch.name.clone(),
                        index: *index,
                    });
                }
            }
        }

        // Every parent chain must end at a root.
        for name in branches.keys() {
            let mut seen = BTreeSet::new();
            let mut cursor = Some(name.as_str());
            while let Some(at) = cursor {
                if !seen.insert(at) {
                    return Err(IsoError::InvalidArgument(format!(
                        "branch {name:?} has a cyclic parent chain"
                    )));
                }
                cursor = branches.get(at).and_then(|b| b.parent.as_deref());
            }
        }

        let next_index = snapshots.keys().next_back().map_or(1, |max| max + 1);
        Ok(Self {
            branches,
            snapshots,
            current,
            next_index,
        })
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn branch_info(&self, name: &str) -> Result<&Branch> {
        self.branches
            .get(name)
            .ok_or_else(|| IsoError::BranchNotFound(name.to_string()))
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    pub fn snapshot(&self, index: u64) -> Option<&Snapshot> {
        self.snapshots.get(&index)
    }

    pub fn capture(&mut self, state: FilterState, label: Option<String>) -> u64 {
        self.capture_at(state, label, now_unix_secs())
    }

    /// Append a snapshot to the current branch and return its index.
    pub fn capture_at(&mut self, state: FilterState, label: Option<String>, captured_at: i64) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.snapshots.insert(
            index,
            Snapshot {
                index,
                branch: self.current.clone(),
                captured_at,
                label,
                state,
            },
        );
        if let Some(branch) = self.branches.get_mut(&self.current) {
            branch.snapshots.push(index);
        }
        index
    }

    /// Fork the current branch at its head and switch to the new branch.
    pub fn branch(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(IsoError::InvalidArgument(format!(
                "branch name {name:?} must be non-empty and contain no whitespace"
            )));
        }
        if self.branches.contains_key(name) {
            return Err(IsoError::BranchExists(name.to_string()));
        }
        let base = self.lineage(&self.current)?.len();
        self.branches.insert(
            name.to_string(),
            Branch {
                name: name.to_string(),
                parent: Some(self.current.clone()),
                base,
                snapshots: Vec::new(),
            },
        );
        self.current = name.to_string();
        Ok(())
    }

    pub fn checkout(&mut self, name: &str) -> Result<()> {
        self.branch_info(name)?;
        self.current = name.to_string();
        Ok(())
    }

    /// Every snapshot visible from `name`: the parent's lineage up to the
    /// fork point, then the branch's own snapshots.
    pub fn lineage(&self, name: &str) -> Result<Vec<u64>> {
        let branch = self.branch_info(name)?;
        let mut out = match &branch.parent {
            Some(parent) => {
                let mut inherited = self.lineage(parent)?;
                inherited.truncate(branch.base);
                inherited
            }
            None => Vec::new(),
        };
        out.extend(branch.snapshots.iter().copied());
        Ok(out)
    }

    pub fn head(&self, name: &str) -> Result<Option<&Snapshot>> {
        let lineage = self.lineage(name)?;
        Ok(lineage.last().and_then(|i| self.snapshots.get(i)))
    }

    /// Snapshots between `from` and `to` (inclusive) in `name`'s lineage.
    /// When `from` comes after `to` the slice is returned newest first.
    pub fn range(&self, name: &str, from: u64, to: u64) -> Result<Vec<&Snapshot>> {
        let lineage = self.lineage(name)?;
        let position = |index: u64| {
            lineage
                .iter()
                .position(|i| *i == index)
                .ok_or_else(|| IsoError::SnapshotNotFound {
                    branch: name.to_string(),
                    index,
                })
        };
        let (a, b) = (position(from)?, position(to)?);
        let picked: Vec<u64> = if a <= b {
            lineage[a..=b].to_vec()
        } else {
            lineage[b..=a].iter().rev().copied().collect()
        };
        Ok(picked.iter().filter_map(|i| self.snapshots.get(i)).collect())
    }

    /// Fast-forward `name` onto its parent when the parent has not moved
    /// since the fork; otherwise report the diverging snapshots. A
    /// fast-forwarded branch is removed and its children re-parented.
    pub fn merge(&mut self, name: &str) -> Result<MergeOutcome> {
        let branch = self.branch_info(name)?.clone();
        let Some(parent) = branch.parent.clone() else {
            return Err(IsoError::NoParentBranch(name.to_string()));
        };

        let parent_lineage = self.lineage(&parent)?;
        if parent_lineage.len() != branch.base {
            return Ok(MergeOutcome::Conflict(MergeConflict {
                branch: name.to_string(),
                parent,
                base: branch.base,
                parent_snapshots: parent_lineage.get(branch.base..).unwrap_or(&[]).to_vec(),
                branch_snapshots: branch.snapshots,
            }));
        }

        for index in &branch.snapshots {
            if let Some(snapshot) = self.snapshots.get_mut(index) {
                snapshot.branch = parent.clone();
            }
        }
        if let Some(target) = self.branches.get_mut(&parent) {
            target.snapshots.extend(branch.snapshots.iter().copied());
        }
        for child in self.branches.values_mut() {
            if child.parent.as_deref() == Some(name) {
                child.parent = Some(parent.clone());
            }
        }
        self.branches.remove(name);
        if self.current == name {
            self.current = parent.clone();
        }

        Ok(MergeOutcome::FastForward {
            into: parent,
            transferred: branch.snapshots,
        })
    }
}

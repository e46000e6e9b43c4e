use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stable identity of a replayed cell, minted from 0 within one session.
///
/// Ids double as notebook positions: a cell with a larger id was first seen
/// later in the session.
pub type CellId = u64;

/// A set of cell ids, ordered so that position-based pruning is a split.
pub type CellSet = BTreeSet<CellId>;

/// All cells that currently exist in the replayed notebook, keyed by id,
/// holding the most recently executed source for each.
pub type NotebookState = BTreeMap<CellId, String>;

/// How the dependency analyzer orders cells when propagating staleness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIndex {
    /// Let the analyzer propagate staleness in both directions.
    #[default]
    Default,
    /// Order cells by their own id, so staleness only propagates forward.
    Identity,
}

impl OrderIndex {
    pub fn from_forward_only(forward_only: bool) -> Self {
        if forward_only {
            OrderIndex::Identity
        } else {
            OrderIndex::Default
        }
    }

    pub fn is_forward_only(self) -> bool {
        self == OrderIndex::Identity
    }
}

/// Pass-through options for a dependency analyzer call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeOptions {
    pub order: OrderIndex,
    pub naive_refresher_computation: bool,
}

/// What the dependency analyzer reports for the current notebook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    /// Cells whose outputs are currently considered valid.
    #[serde(default)]
    pub fresh_cells: CellSet,

    /// Cells whose outputs are outdated relative to later edits.
    #[serde(default)]
    pub stale_cells: CellSet,

    /// Refresher cell -> the stale cells its re-execution would resolve.
    #[serde(default)]
    pub refresher_links: BTreeMap<CellId, CellSet>,
}

impl Analysis {
    /// Ids of all cells that appear as refreshers.
    pub fn refresher_cells(&self) -> CellSet {
        self.refresher_links.keys().copied().collect()
    }
}

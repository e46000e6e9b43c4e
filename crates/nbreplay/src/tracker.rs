//! Live/stale/refresher bookkeeping for a replayed notebook.

use crate::types::{Analysis, CellId, CellSet, NotebookState};
use tracing::warn;

/// Classification changes visible to the statistics stage for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationDeltas {
    pub live: CellSet,
    pub stale: CellSet,
    pub refresher: CellSet,
    /// `live − prev_live`
    pub new_live: CellSet,
    /// `stale − prev_stale`
    pub new_stale: CellSet,
    /// `refresher − prev_refresher`
    pub new_refresher: CellSet,
    /// `refresher ∪ new_live`
    pub new_or_refresher: CellSet,
}

/// The evolving notebook and its three classification sets.
///
/// One step per executed cell:
///
/// 1. [`begin_step`](Self::begin_step) prunes every classification set of
///    ids at or after the executed cell's position, snapshots the pruned
///    sets as the previous step's view, and commits the cell's source;
/// 2. the caller asks a dependency analyzer about [`state`](Self::state);
/// 3. [`absorb`](Self::absorb) unions the analyzer's answer into the sets.
///
/// Every id held by a classification set is a key of the notebook state.
#[derive(Debug, Clone, Default)]
pub struct NotebookTracker {
    state: NotebookState,
    live: CellSet,
    stale: CellSet,
    refresher: CellSet,
    prev_live: CellSet,
    prev_stale: CellSet,
    prev_refresher: CellSet,
    last_cell: Option<CellId>,
}

impl NotebookTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &NotebookState {
        &self.state
    }

    pub fn live(&self) -> &CellSet {
        &self.live
    }

    pub fn stale(&self) -> &CellSet {
        &self.stale
    }

    pub fn refresher(&self) -> &CellSet {
        &self.refresher
    }

    pub fn contains(&self, cell: CellId) -> bool {
        self.state.contains_key(&cell)
    }

    pub fn is_stale(&self, cell: CellId) -> bool {
        self.stale.contains(&cell)
    }

    /// The cell executed by the most recent step.
    pub fn last_cell(&self) -> Option<CellId> {
        self.last_cell
    }

    /// Deltas for a step about to execute `cell`, or `None` when the step
    /// cannot be scored: there is no previous step, the previous step ran
    /// the same cell, or the previous cell is not in the notebook.
    pub fn deltas_for(&self, cell: CellId) -> Option<ClassificationDeltas> {
        let previous = self.last_cell?;
        if previous == cell || !self.contains(previous) {
            return None;
        }
        Some(self.deltas())
    }

    /// Current sets and their differences against the previous snapshot.
    pub fn deltas(&self) -> ClassificationDeltas {
        let new_live: CellSet = self.live.difference(&self.prev_live).copied().collect();
        let new_or_refresher = self.refresher.union(&new_live).copied().collect();
        ClassificationDeltas {
            live: self.live.clone(),
            stale: self.stale.clone(),
            refresher: self.refresher.clone(),
            new_stale: self.stale.difference(&self.prev_stale).copied().collect(),
            new_refresher: self
                .refresher
                .difference(&self.prev_refresher)
                .copied()
                .collect(),
            new_live,
            new_or_refresher,
        }
    }

    /// Prune, snapshot, and commit `source` as the current content of `cell`.
    pub fn begin_step(&mut self, cell: CellId, source: impl Into<String>) {
        for set in [&mut self.live, &mut self.stale, &mut self.refresher] {
            discard_from_position(set, cell);
        }
        self.prev_live = self.live.clone();
        self.prev_stale = self.stale.clone();
        self.prev_refresher = self.refresher.clone();
        self.state.insert(cell, source.into());
        self.last_cell = Some(cell);
    }

    /// Union an analyzer result into the classification sets.
    ///
    /// Ids that are not cells of the notebook are ignored; the number of
    /// ignored ids is returned.
    pub fn absorb(&mut self, analysis: Analysis) -> usize {
        let refreshers = analysis.refresher_cells();
        let mut ignored = 0;
        ignored += union_known(&mut self.live, analysis.fresh_cells, &self.state);
        ignored += union_known(&mut self.stale, analysis.stale_cells, &self.state);
        ignored += union_known(&mut self.refresher, refreshers, &self.state);
        if ignored > 0 {
            warn!(ignored, "analyzer reported cells missing from the notebook");
        }
        ignored
    }
}

/// Remove every id at or after `position`.
fn discard_from_position(set: &mut CellSet, position: CellId) {
    set.split_off(&position);
}

fn union_known(target: &mut CellSet, ids: CellSet, state: &NotebookState) -> usize {
    let mut ignored = 0;
    for id in ids {
        if state.contains_key(&id) {
            target.insert(id);
        } else {
            ignored += 1;
        }
    }
    ignored
}

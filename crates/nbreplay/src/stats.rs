//! Predictive-power statistics.
//!
//! Each [`StatAccumulator`] answers one question of the form "how much better
//! than chance does this candidate set predict the next executed cell?". A
//! uniformly random candidate set of size `k` drawn from `N` cells contains
//! the true cell with probability `p = k / N`; the accumulators compare the
//! observed hit rate against that chance rate three ways:
//!
//! - `predictive_power`: total hits over total expected hits (micro average),
//!   dominated by steps where chance is high;
//! - `macro_predictive_power`: the mean of `hit / p` over attempts, weighting
//!   every attempt equally;
//! - `normalized_predictive_power`: the mean of `(hit / p − 1) / (k − 1)`,
//!   a lift rescaled so that sessions with different candidate-set sizes are
//!   comparable.

use crate::tracker::ClassificationDeltas;
use crate::types::{CellId, CellSet, NotebookState};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;

// ============================================================================
// Accumulator
// ============================================================================

/// Online accumulator for one prediction question.
#[derive(Debug, Clone, PartialEq)]
pub struct StatAccumulator {
    name: &'static str,
    reports_candidate_sizes: bool,
    pub correct_sum: f64,
    pub micro_denominator_sum: f64,
    pub macro_sum: f64,
    pub normalized_sum: f64,
    pub attempt_count: u64,
    pub candidate_counts: Vec<usize>,
}

impl StatAccumulator {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reports_candidate_sizes: true,
            correct_sum: 0.0,
            micro_denominator_sum: 0.0,
            macro_sum: 0.0,
            normalized_sum: 0.0,
            attempt_count: 0,
            candidate_counts: Vec::new(),
        }
    }

    /// Leave `avg_num_*` and `median_num_*` out of [`finalize`](Self::finalize).
    pub fn without_candidate_sizes(mut self) -> Self {
        self.reports_candidate_sizes = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Score `candidates` against the `observed` cell among `universe` cells.
    ///
    /// A universe of at most one cell or an empty candidate set carries no
    /// information and leaves the accumulator untouched. A single-candidate
    /// set contributes zero to the normalized sum, where the rescaling is
    /// undefined.
    pub fn update(&mut self, observed: CellId, candidates: &CellSet, universe: usize) {
        if universe <= 1 || candidates.is_empty() {
            return;
        }
        let size = candidates.len() as f64;
        let chance = size / universe as f64;
        let correct = if candidates.contains(&observed) {
            1.0
        } else {
            0.0
        };

        self.micro_denominator_sum += chance;
        self.macro_sum += correct / chance;
        if candidates.len() > 1 {
            self.normalized_sum += (correct / chance - 1.0) / (size - 1.0);
        }
        self.correct_sum += correct;
        self.attempt_count += 1;
        self.candidate_counts.push(candidates.len());
    }

    /// Score a random baseline: sample `count` distinct ids uniformly from
    /// `universe` and score them as the candidate set.
    ///
    /// `count` is clamped to the universe size.
    pub fn update_sampled<R: Rng + ?Sized>(
        &mut self,
        observed: CellId,
        count: usize,
        universe: &[CellId],
        rng: &mut R,
    ) {
        let count = count.min(universe.len());
        let sampled: CellSet = universe.choose_multiple(rng, count).copied().collect();
        self.update(observed, &sampled, universe.len());
    }

    /// Final scores keyed by metric name; empty when nothing was scored.
    pub fn finalize(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if self.attempt_count == 0 {
            return out;
        }
        let attempts = self.attempt_count as f64;
        let keys = metric_keys(self.name, self.reports_candidate_sizes);

        out.insert(
            keys[0].clone(),
            self.correct_sum / self.micro_denominator_sum,
        );
        out.insert(keys[1].clone(), self.macro_sum / attempts);
        out.insert(keys[2].clone(), self.normalized_sum / attempts);
        if self.reports_candidate_sizes {
            out.insert(keys[3].clone(), mean(&self.candidate_counts));
            out.insert(keys[4].clone(), median(&self.candidate_counts));
        }
        out
    }
}

/// Metric names produced for a question, in a fixed order: the three
/// scores, then (optionally) average and median candidate counts.
pub fn metric_keys(question: &str, with_candidate_sizes: bool) -> Vec<String> {
    let mut keys = vec![
        format!("predictive_power_{question}"),
        format!("macro_predictive_power_{question}"),
        format!("normalized_predictive_power_{question}"),
    ];
    if with_candidate_sizes {
        keys.push(format!("avg_num_{question}"));
        keys.push(format!("median_num_{question}"));
    }
    keys
}

fn mean(values: &[usize]) -> f64 {
    values.iter().sum::<usize>() as f64 / values.len() as f64
}

fn median(values: &[usize]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}

// ============================================================================
// Replay questions
// ============================================================================

const NEXT_CELL: &str = "next_cell";
const RANDOM_CELL: &str = "random_cell";
const LIVE_CELLS: &str = "live_cells";
const NEW_LIVE_CELLS: &str = "new_live_cells";
const NEW_OR_REFRESHER_CELLS: &str = "new_or_refresher_cells";
const REFRESHER_CELLS: &str = "refresher_cells";
const NEW_REFRESHER_CELLS: &str = "new_refresher_cells";
const RANDOM_LIKE_NEW_REFRESHER_CELLS: &str = "random_like_new_refresher_cells";
const STALE_CELLS: &str = "stale_cells";
const NEW_STALE_CELLS: &str = "new_stale_cells";

/// Every question scored during a replay, in reporting order.
pub const QUESTIONS: [&str; 10] = [
    NEXT_CELL,
    RANDOM_CELL,
    LIVE_CELLS,
    NEW_LIVE_CELLS,
    NEW_OR_REFRESHER_CELLS,
    REFRESHER_CELLS,
    NEW_REFRESHER_CELLS,
    RANDOM_LIKE_NEW_REFRESHER_CELLS,
    STALE_CELLS,
    NEW_STALE_CELLS,
];

/// The accumulators for one replay session, one per question in [`QUESTIONS`].
#[derive(Debug, Clone)]
pub struct ReplayStats {
    accumulators: Vec<StatAccumulator>,
}

impl Default for ReplayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayStats {
    pub fn new() -> Self {
        let accumulators = QUESTIONS
            .iter()
            .map(|&q| {
                let acc = StatAccumulator::new(q);
                if q == NEXT_CELL {
                    acc.without_candidate_sizes()
                } else {
                    acc
                }
            })
            .collect();
        Self { accumulators }
    }

    pub fn accumulators(&self) -> &[StatAccumulator] {
        &self.accumulators
    }

    pub fn get(&self, question: &str) -> Option<&StatAccumulator> {
        self.accumulators.iter().find(|a| a.name == question)
    }

    fn acc(&mut self, question: &str) -> Option<&mut StatAccumulator> {
        self.accumulators.iter_mut().find(|a| a.name == question)
    }

    fn update(&mut self, question: &str, observed: CellId, candidates: &CellSet, universe: usize) {
        if let Some(acc) = self.acc(question) {
            acc.update(observed, candidates, universe);
        }
    }

    fn update_sampled<R: Rng + ?Sized>(
        &mut self,
        question: &str,
        observed: CellId,
        count: usize,
        universe: &[CellId],
        rng: &mut R,
    ) {
        if let Some(acc) = self.acc(question) {
            acc.update_sampled(observed, count, universe, rng);
        }
    }

    /// Score one step: `observed` is the cell about to execute, `previous`
    /// the cell executed by the step before, `notebook` the cells that
    /// existed before this step.
    ///
    /// Returns `false` when every accumulator skipped the step, e.g. when
    /// the notebook held a single cell.
    pub fn record<R: Rng + ?Sized>(
        &mut self,
        observed: CellId,
        previous: CellId,
        deltas: &ClassificationDeltas,
        notebook: &NotebookState,
        rng: &mut R,
    ) -> bool {
        let attempts_before = self.total_attempts();
        let universe = notebook.len();
        let ids: Vec<CellId> = notebook.keys().copied().collect();

        self.update(NEXT_CELL, observed, &CellSet::from([previous + 1]), universe);
        self.update_sampled(RANDOM_CELL, observed, 1, &ids, rng);
        self.update(LIVE_CELLS, observed, &deltas.live, universe);
        self.update(NEW_LIVE_CELLS, observed, &deltas.new_live, universe);
        self.update(REFRESHER_CELLS, observed, &deltas.refresher, universe);
        self.update(NEW_OR_REFRESHER_CELLS, observed, &deltas.new_or_refresher, universe);
        self.update(NEW_REFRESHER_CELLS, observed, &deltas.new_refresher, universe);
        self.update_sampled(
            RANDOM_LIKE_NEW_REFRESHER_CELLS,
            observed,
            deltas.new_refresher.len(),
            &ids,
            rng,
        );
        self.update(STALE_CELLS, observed, &deltas.stale, universe);
        self.update(NEW_STALE_CELLS, observed, &deltas.new_stale, universe);

        self.total_attempts() > attempts_before
    }

    fn total_attempts(&self) -> u64 {
        self.accumulators.iter().map(|a| a.attempt_count).sum()
    }

    /// The flattened metrics of every accumulator.
    pub fn finalize(&self) -> BTreeMap<String, f64> {
        self.accumulators
            .iter()
            .flat_map(|a| a.finalize())
            .collect()
    }

    /// Every metric name [`finalize`](Self::finalize) can produce.
    pub fn metric_names() -> Vec<String> {
        QUESTIONS
            .iter()
            .flat_map(|&q| metric_keys(q, q != NEXT_CELL))
            .collect()
    }
}

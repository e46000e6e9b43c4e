//! Near-duplicate matching of cell sources and stable cell identities.
//!
//! Replayed histories often contain the same logical cell executed several
//! times with small edits in between (a changed literal, a fixed typo). The
//! [`CellIdentityResolver`] folds such retries onto one [`CellId`] by
//! querying a [`NearDuplicateIndex`] of every source seen so far.

use crate::types::CellId;
use std::collections::HashMap;
use tracing::debug;

/// Minimum similarity for a source to reuse an existing cell id.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

const GRAM_SIZE_UPPER: usize = 3;
const GRAM_SIZE_LOWER: usize = 2;
const RESCORED_CANDIDATES: usize = 50;

// ============================================================================
// Near-duplicate index
// ============================================================================

/// The best stored match for a query, with the value stored alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Match<'a, T> {
    /// Similarity in `[0, 1]`; 1.0 for a case-insensitive exact hit.
    pub score: f64,
    /// The stored source text that matched.
    pub source: &'a str,
    pub value: &'a T,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    source: String,
    folded: String,
    value: T,
}

#[derive(Debug, Clone)]
struct GramTable {
    size: usize,
    postings: HashMap<String, Vec<(usize, u32)>>,
    norms: Vec<f64>,
}

impl GramTable {
    fn new(size: usize) -> Self {
        Self {
            size,
            postings: HashMap::new(),
            norms: Vec::new(),
        }
    }
}

/// An approximate-similarity index over source strings.
///
/// Candidates are found through character n-gram vectors (trigrams first,
/// bigrams as a fallback) and the closest 50 by cosine similarity are
/// re-scored with `1 - levenshtein(a, b) / max(len(a), len(b))`. Comparison is
/// case-insensitive, so inserting a source that only differs in case from a
/// stored one is a no-op.
///
/// When several stored sources tie for the best score, any one of them may
/// be returned.
#[derive(Debug, Clone)]
pub struct NearDuplicateIndex<T> {
    entries: Vec<Entry<T>>,
    exact: HashMap<String, usize>,
    tables: Vec<GramTable>,
}

impl<T> Default for NearDuplicateIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NearDuplicateIndex<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            exact: HashMap::new(),
            tables: (GRAM_SIZE_LOWER..=GRAM_SIZE_UPPER)
                .rev()
                .map(GramTable::new)
                .collect(),
        }
    }

    /// Number of distinct (case-folded) sources stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `source` with `value`. Returns `false` if an equal source (ignoring
    /// case) is already stored, in which case the index is unchanged.
    pub fn insert(&mut self, source: &str, value: T) -> bool {
        let folded = source.to_lowercase();
        if self.exact.contains_key(&folded) {
            return false;
        }

        let idx = self.entries.len();
        for table in &mut self.tables {
            let grams = gram_counts(&folded, table.size);
            table.norms.push(vector_norm(&grams));
            for (gram, count) in grams {
                table.postings.entry(gram).or_default().push((idx, count));
            }
        }
        self.exact.insert(folded.clone(), idx);
        self.entries.push(Entry {
            source: source.to_string(),
            folded,
            value,
        });
        true
    }

    /// The stored source most similar to `source`, if any shares an n-gram.
    pub fn best_match(&self, source: &str) -> Option<Match<'_, T>> {
        let folded = source.to_lowercase();
        if let Some(&idx) = self.exact.get(&folded) {
            return Some(self.match_at(idx, 1.0));
        }
        self.tables
            .iter()
            .find_map(|table| self.best_in_table(table, &folded))
    }

    fn best_in_table(&self, table: &GramTable, folded: &str) -> Option<Match<'_, T>> {
        let grams = gram_counts(folded, table.size);
        let query_norm = vector_norm(&grams);

        let mut dots: HashMap<usize, f64> = HashMap::new();
        for (gram, count) in &grams {
            if let Some(postings) = table.postings.get(gram) {
                for &(idx, stored) in postings {
                    *dots.entry(idx).or_insert(0.0) += f64::from(count * stored);
                }
            }
        }
        if dots.is_empty() {
            return None;
        }

        let mut ranked: Vec<(usize, f64)> = dots
            .into_iter()
            .map(|(idx, dot)| (idx, dot / (query_norm * table.norms[idx])))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(RESCORED_CANDIDATES);

        ranked
            .into_iter()
            .map(|(idx, _)| {
                (idx, strsim::normalized_levenshtein(&self.entries[idx].folded, folded))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, score)| self.match_at(idx, score))
    }

    fn match_at(&self, idx: usize, score: f64) -> Match<'_, T> {
        let entry = &self.entries[idx];
        Match {
            score,
            source: &entry.source,
            value: &entry.value,
        }
    }
}

/// Lowercased text reduced to word characters, commas and spaces, padded
/// with `-` on both ends.
fn simplify(folded: &str) -> Vec<char> {
    let mut chars = vec!['-'];
    chars.extend(
        folded
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '_' | ',' | ' ')),
    );
    chars.push('-');
    chars
}

fn gram_counts(folded: &str, size: usize) -> HashMap<String, u32> {
    let mut chars = simplify(folded);
    while chars.len() < size {
        chars.push('-');
    }
    let mut counts = HashMap::new();
    for window in chars.windows(size) {
        *counts.entry(window.iter().collect::<String>()).or_insert(0) += 1;
    }
    counts
}

fn vector_norm(grams: &HashMap<String, u32>) -> f64 {
    grams
        .values()
        .map(|&c| f64::from(c) * f64::from(c))
        .sum::<f64>()
        .sqrt()
}

// ============================================================================
// Identity resolver
// ============================================================================

/// Assigns stable ids to cell sources, merging near-duplicates.
///
/// Ids are minted from 0 without gaps and never reused. Every resolved
/// source is added to the index, even when it reuses an id, so a cell that
/// drifts a little on every retry keeps matching its previous version.
#[derive(Debug, Clone)]
pub struct CellIdentityResolver {
    index: NearDuplicateIndex<CellId>,
    threshold: f64,
    next_id: CellId,
}

impl Default for CellIdentityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl CellIdentityResolver {
    pub fn new(threshold: f64) -> Self {
        Self {
            index: NearDuplicateIndex::new(),
            threshold,
            next_id: 0,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Number of distinct ids minted so far.
    pub fn cells_created(&self) -> u64 {
        self.next_id
    }

    /// Resolve `source` to a cell id, reusing the id of the best stored match
    /// when its similarity reaches the threshold.
    pub fn resolve(&mut self, source: &str) -> CellId {
        let reused = self
            .index
            .best_match(source)
            .filter(|m| m.score >= self.threshold)
            .map(|m| (*m.value, m.score));

        let id = match reused {
            Some((id, score)) => {
                debug!(cell_id = id, score, "matched previously executed cell");
                id
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.index.insert(source, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOAD: &str = "df = pd.read_csv('train.csv')\ndf.describe()";
    const LOAD_EDITED: &str = "df = pd.read_csv('train_v2.csv')\ndf.describe()";
    const FIT: &str = "model = LinearRegression()\nmodel.fit(features, labels)";
    const PLOT: &str = "plt.plot(history['loss'])\nplt.show()";

    // ── Index ────────────────────────────────────────────────────────────

    #[test]
    fn test_empty_index_has_no_match() {
        let index: NearDuplicateIndex<u32> = NearDuplicateIndex::new();
        assert!(index.is_empty());
        assert!(index.best_match(LOAD).is_none());
    }

    #[test]
    fn test_exact_match_scores_one() {
        let mut index = NearDuplicateIndex::new();
        index.insert(LOAD, 7u32);
        let m = index.best_match(LOAD).unwrap();
        assert_eq!(m.score, 1.0);
        assert_eq!(m.source, LOAD);
        assert_eq!(*m.value, 7);
    }

    #[test]
    fn test_match_ignores_case() {
        let mut index = NearDuplicateIndex::new();
        index.insert("Import NumPy as NP", 1u32);
        let m = index.best_match("import numpy as np").unwrap();
        assert_eq!(m.score, 1.0);
        assert_eq!(m.source, "Import NumPy as NP");
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut index = NearDuplicateIndex::new();
        assert!(index.insert(LOAD, 1u32));
        assert!(!index.insert(LOAD, 2u32));
        assert!(!index.insert(&LOAD.to_uppercase(), 3u32));
        assert_eq!(index.len(), 1);
        assert_eq!(*index.best_match(LOAD).unwrap().value, 1);
    }

    #[test]
    fn test_near_duplicate_scores_high() {
        let mut index = NearDuplicateIndex::new();
        index.insert(LOAD, ());
        index.insert(FIT, ());
        let m = index.best_match(LOAD_EDITED).unwrap();
        assert_eq!(m.source, LOAD);
        assert!(m.score > 0.9, "score was {}", m.score);
    }

    #[test]
    fn test_score_is_normalized_edit_distance() {
        let mut index = NearDuplicateIndex::new();
        index.insert("df = pd.read_csv('train.csv')", ());
        // Nine appended characters over a 38 character query.
        let m = index
            .best_match("DF = pd.read_csv('train.csv').dropna()")
            .unwrap();
        assert!((m.score - (1.0 - 9.0 / 38.0)).abs() < 1e-9, "score was {}", m.score);
    }

    #[test]
    fn test_unrelated_source_scores_low() {
        let mut index = NearDuplicateIndex::new();
        index.insert(LOAD, ());
        let score = index.best_match(PLOT).map(|m| m.score).unwrap_or(0.0);
        assert!(score < 0.8, "score was {score}");
    }

    #[test]
    fn test_gram_counts_pad_short_input() {
        let grams = gram_counts("", 3);
        assert_eq!(grams.len(), 1);
        assert_eq!(grams["---"], 1);
    }

    #[test]
    fn test_simplify_strips_punctuation() {
        let chars: String = simplify("a.b(c, d)").into_iter().collect();
        assert_eq!(chars, "-abc, d-");
    }

    // ── Resolver ─────────────────────────────────────────────────────────

    #[test]
    fn test_same_source_same_id() {
        let mut resolver = CellIdentityResolver::default();
        let a = resolver.resolve(LOAD);
        let b = resolver.resolve(LOAD);
        assert_eq!(a, b);
        assert_eq!(resolver.cells_created(), 1);
    }

    #[test]
    fn test_near_duplicate_reuses_id() {
        let mut resolver = CellIdentityResolver::default();
        let first = resolver.resolve(LOAD);
        let fit = resolver.resolve(FIT);
        let retry = resolver.resolve(LOAD_EDITED);
        assert_eq!(first, retry);
        assert_ne!(first, fit);
    }

    #[test]
    fn test_appended_call_is_a_new_cell() {
        let mut resolver = CellIdentityResolver::default();
        let load = resolver.resolve("df = pd.read_csv('train.csv')");
        let cleaned = resolver.resolve("df = pd.read_csv('train.csv').dropna()");
        assert_eq!((load, cleaned), (0, 1));
        assert_eq!(resolver.cells_created(), 2);
    }

    #[test]
    fn test_distinct_sources_get_increasing_ids() {
        let mut resolver = CellIdentityResolver::default();
        let ids: Vec<CellId> = [LOAD, FIT, PLOT]
            .iter()
            .map(|s| resolver.resolve(s))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(resolver.cells_created(), 3);
    }

    #[test]
    fn test_ids_are_gapless_across_reuse() {
        let mut resolver = CellIdentityResolver::default();
        let ids: Vec<CellId> = [LOAD, LOAD_EDITED, FIT, LOAD, PLOT, FIT]
            .iter()
            .map(|s| resolver.resolve(s))
            .collect();
        assert_eq!(ids, vec![0, 0, 1, 0, 2, 1]);
    }

    #[test]
    fn test_drifting_retries_match_transitively() {
        let mut resolver = CellIdentityResolver::default();
        let v1 = "result = train(model, epochs=10, lr=0.001, batch_size=32)";
        let v2 = "result = train(model, epochs=20, lr=0.001, batch_size=32)";
        let v3 = "result = train(model, epochs=20, lr=0.005, batch_size=32)";
        let v4 = "result = train(model, epochs=20, lr=0.005, batch_size=64)";
        let ids: Vec<CellId> = [v1, v2, v3, v4]
            .iter()
            .map(|s| resolver.resolve(s))
            .collect();
        assert_eq!(ids, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_threshold_one_only_merges_exact() {
        let mut resolver = CellIdentityResolver::new(1.0);
        let a = resolver.resolve(LOAD);
        let b = resolver.resolve(LOAD_EDITED);
        let c = resolver.resolve(LOAD);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_threshold_zero_merges_everything_that_overlaps() {
        let mut resolver = CellIdentityResolver::new(0.0);
        let a = resolver.resolve(LOAD);
        let b = resolver.resolve(FIT);
        assert_eq!(a, b);
        assert_eq!(resolver.threshold(), 0.0);
    }
}

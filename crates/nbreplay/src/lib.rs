#![doc = include_str!("../README.md")]

mod identity;
mod normalize;
mod stats;
mod tracker;
mod types;

pub use identity::{CellIdentityResolver, DEFAULT_SIMILARITY_THRESHOLD, Match, NearDuplicateIndex};
pub use normalize::{NormalizeError, normalize_cell};
pub use stats::{QUESTIONS, ReplayStats, StatAccumulator, metric_keys};
pub use tracker::{ClassificationDeltas, NotebookTracker};
pub use types::{AnalyzeOptions, Analysis, CellId, CellSet, NotebookState, OrderIndex};

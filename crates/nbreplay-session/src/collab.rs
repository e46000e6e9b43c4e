//! Capability traits for the collaborators a replay depends on.
//!
//! The orchestrator never executes code or analyzes dependencies itself; it
//! drives an [`ExecutionSandbox`] and a [`DependencyAnalyzer`] and hands the
//! finished summary to a [`SummarySink`]. `nbreplay-kernel` implements the
//! first two against an external kernel worker, `nbreplay-store` the third
//! against SQLite, and [`crate::testing`] has deterministic fakes.

use crate::error::CollabError;
use crate::summary::SessionSummary;
use nbreplay::{AnalyzeOptions, Analysis, CellId, NotebookState};
use serde::{Deserialize, Serialize};

/// One source string to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecRequest<'a> {
    /// The replayed cell, or `None` for setup code such as the prelude.
    pub cell_id: Option<CellId>,
    pub source: &'a str,
    /// Run under the analyzer's tracing so violations can be reported.
    pub tracked: bool,
}

impl<'a> ExecRequest<'a> {
    pub fn cell(cell_id: CellId, source: &'a str, tracked: bool) -> Self {
        Self {
            cell_id: Some(cell_id),
            source,
            tracked,
        }
    }

    pub fn setup(source: &'a str) -> Self {
        Self {
            cell_id: None,
            source,
            tracked: false,
        }
    }
}

/// What happened when a source string ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Kind of the exception the executed code raised, e.g. `NameError`.
    #[serde(default)]
    pub exception: Option<String>,

    /// Whether the analyzer flagged a staleness violation during a tracked
    /// execution. Always `false` for untracked runs.
    #[serde(default)]
    pub violation: bool,
}

impl ExecOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn raised(kind: impl Into<String>) -> Self {
        Self {
            exception: Some(kind.into()),
            violation: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exception.is_none()
    }
}

/// Executes replayed sources in a live interpreter.
///
/// An `Err` means the sandbox itself is unusable (the worker died, a pipe
/// broke). An exception raised by the executed code is an `Ok` outcome with
/// [`ExecOutcome::exception`] set.
#[allow(async_fn_in_trait)]
pub trait ExecutionSandbox {
    async fn execute(&self, request: ExecRequest<'_>) -> Result<ExecOutcome, CollabError>;

    /// Stop the cell abandoned after a timeout. Implementations should keep
    /// interpreter state when they can.
    async fn interrupt(&self) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Classifies the cells of a notebook as fresh, stale or refresher.
#[allow(async_fn_in_trait)]
pub trait DependencyAnalyzer {
    async fn analyze(
        &self,
        notebook: &NotebookState,
        options: AnalyzeOptions,
    ) -> Result<Analysis, CollabError>;
}

/// Receives the summary of a finished (or interrupted) session.
pub trait SummarySink {
    fn persist(&mut self, summary: &SessionSummary) -> Result<(), CollabError>;
}

impl<T: SummarySink + ?Sized> SummarySink for &mut T {
    fn persist(&mut self, summary: &SessionSummary) -> Result<(), CollabError> {
        (**self).persist(summary)
    }
}

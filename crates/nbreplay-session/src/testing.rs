//! Deterministic collaborators for tests and dry runs.

use crate::collab::{DependencyAnalyzer, ExecOutcome, ExecRequest, ExecutionSandbox, SummarySink};
use crate::error::CollabError;
use crate::summary::SessionSummary;
use nbreplay::{AnalyzeOptions, Analysis, CellId, NotebookState};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A call seen by [`ScriptedSandbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub cell_id: Option<CellId>,
    pub source: String,
    pub tracked: bool,
}

#[derive(Debug, Clone)]
enum Rule {
    Raise { pattern: String, kind: String },
    Hang { pattern: String },
    Break { pattern: String },
    Violation { pattern: String },
}

/// A sandbox that runs nothing and reacts to substrings of the source.
///
/// Sources matching no rule succeed. Rules are checked in the order they
/// were added.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    rules: Vec<Rule>,
    calls: Mutex<Vec<RecordedCall>>,
    interrupts: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an exception of `kind` when the source contains `pattern`.
    pub fn fail_when(mut self, pattern: &str, kind: &str) -> Self {
        self.rules.push(Rule::Raise {
            pattern: pattern.to_string(),
            kind: kind.to_string(),
        });
        self
    }

    /// Never finish when the source contains `pattern`.
    pub fn hang_when(mut self, pattern: &str) -> Self {
        self.rules.push(Rule::Hang {
            pattern: pattern.to_string(),
        });
        self
    }

    /// Fail as a sandbox (not as the executed code) on `pattern`.
    pub fn break_when(mut self, pattern: &str) -> Self {
        self.rules.push(Rule::Break {
            pattern: pattern.to_string(),
        });
        self
    }

    /// Report a staleness violation for tracked runs matching `pattern`.
    pub fn flag_violation_when(mut self, pattern: &str) -> Self {
        self.rules.push(Rule::Violation {
            pattern: pattern.to_string(),
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl ExecutionSandbox for ScriptedSandbox {
    async fn execute(&self, request: ExecRequest<'_>) -> Result<ExecOutcome, CollabError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                cell_id: request.cell_id,
                source: request.source.to_string(),
                tracked: request.tracked,
            });
        }

        let mut outcome = ExecOutcome::ok();
        for rule in &self.rules {
            match rule {
                Rule::Raise { pattern, kind } if request.source.contains(pattern.as_str()) => {
                    return Ok(ExecOutcome::raised(kind.as_str()));
                }
                Rule::Hang { pattern } if request.source.contains(pattern.as_str()) => {
                    std::future::pending::<()>().await;
                }
                Rule::Break { pattern } if request.source.contains(pattern.as_str()) => {
                    return Err(CollabError::Collaborator(format!(
                        "sandbox broke on {pattern:?}"
                    )));
                }
                Rule::Violation { pattern }
                    if request.tracked && request.source.contains(pattern.as_str()) =>
                {
                    outcome.violation = true;
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    async fn interrupt(&self) -> Result<(), CollabError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type AnalyzeFn =
    dyn Fn(&NotebookState, AnalyzeOptions) -> Result<Analysis, CollabError> + Send + Sync;

/// An analyzer backed by a closure.
pub struct FnAnalyzer {
    analyze: Box<AnalyzeFn>,
    seen: Mutex<Vec<(usize, AnalyzeOptions)>>,
}

impl FnAnalyzer {
    pub fn new<F>(analyze: F) -> Self
    where
        F: Fn(&NotebookState, AnalyzeOptions) -> Result<Analysis, CollabError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            analyze: Box::new(analyze),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// An analyzer that never classifies anything.
    pub fn empty() -> Self {
        Self::new(|_, _| Ok(Analysis::default()))
    }

    /// Notebook size and options of every call so far.
    pub fn calls(&self) -> Vec<(usize, AnalyzeOptions)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl std::fmt::Debug for FnAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAnalyzer").finish_non_exhaustive()
    }
}

impl DependencyAnalyzer for FnAnalyzer {
    async fn analyze(
        &self,
        notebook: &NotebookState,
        options: AnalyzeOptions,
    ) -> Result<Analysis, CollabError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((notebook.len(), options));
        }
        (self.analyze)(notebook, options)
    }
}

/// Keeps persisted summaries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub summaries: Vec<SessionSummary>,
}

impl SummarySink for MemorySink {
    fn persist(&mut self, summary: &SessionSummary) -> Result<(), CollabError> {
        self.summaries.push(summary.clone());
        Ok(())
    }
}

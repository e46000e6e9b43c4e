//! The replay loop.
//!
//! For every recorded cell, in order:
//!
//! 1. filter the source ([`normalize_cell`]); cells left empty are skipped;
//! 2. resolve the cell id, counting a safety error if that cell is stale;
//! 3. execute it in the sandbox under the configured timeout;
//! 4. if it ran cleanly and the previous step ran a different known cell,
//!    score the tracker's current deltas against the observed id;
//! 5. commit the source and let the analyzer re-derive the classification
//!    sets.
//!
//! Exceptions and timeouts are counted and only make the step ineligible
//! for scoring. Sandbox and analyzer failures abort the session. An
//! interrupt stops the loop and still yields a summary of what ran.

use crate::collab::{DependencyAnalyzer, ExecOutcome, ExecRequest, ExecutionSandbox, SummarySink};
use crate::config::ReplayConfig;
use crate::error::{CollabError, ReplayError, Result};
use crate::interrupt::Interrupt;
use crate::summary::{SessionKey, SessionSummary, StepRecord};
use nbreplay::{CellIdentityResolver, NotebookTracker, ReplayStats, normalize_cell};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Exception kind recorded when a cell exceeds the execution timeout.
pub const TIMEOUT_FAULT: &str = "TimeoutError";

enum Executed {
    Finished(ExecOutcome),
    TimedOut,
    Interrupted,
}

/// Replays recorded sessions against a sandbox and an analyzer.
///
/// A `Replayer` can run several sessions one after another; every call to
/// [`replay`](Self::replay) starts from a fresh resolver, tracker and set of
/// accumulators.
pub struct Replayer<'a, S, A> {
    config: ReplayConfig,
    sandbox: &'a S,
    analyzer: &'a A,
    interrupt: Interrupt,
}

impl<'a, S, A> Replayer<'a, S, A>
where
    S: ExecutionSandbox,
    A: DependencyAnalyzer,
{
    pub fn new(config: ReplayConfig, sandbox: &'a S, analyzer: &'a A) -> Self {
        Self {
            config,
            sandbox,
            analyzer,
            interrupt: Interrupt::never(),
        }
    }

    /// Stop replaying when `interrupt` fires.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Replay `cells` and hand the summary to `sink`, unless persistence is
    /// disabled in the config.
    pub async fn replay_and_persist<K: SummarySink>(
        &mut self,
        key: SessionKey,
        cells: &[String],
        sink: &mut K,
    ) -> Result<SessionSummary> {
        let summary = self.replay(key, cells).await?;
        if self.config.persist_stats {
            sink.persist(&summary).map_err(ReplayError::Persist)?;
            info!(%key, "persisted replay summary");
        } else {
            debug!(%key, "stats persistence disabled");
        }
        Ok(summary)
    }

    /// Replay `cells` in order and return the session summary.
    pub async fn replay(&mut self, key: SessionKey, cells: &[String]) -> Result<SessionSummary> {
        self.config.validate()?;
        let timeout = self.config.execution_timeout()?;
        let tracked = self.config.tracked;
        let options = self.config.analyze_options();

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut resolver = CellIdentityResolver::new(self.config.similarity_threshold);
        let mut tracker = NotebookTracker::new();
        let mut stats = ReplayStats::new();
        let mut summary = SessionSummary::new(key);
        let started = Instant::now();

        info!(%key, cells = cells.len(), tracked, "starting replay");

        if !self.run_prelude(timeout).await? {
            summary.interrupted = true;
        }

        for (idx, raw) in cells.iter().enumerate() {
            if summary.interrupted {
                break;
            }
            if self.interrupt.is_triggered() {
                summary.interrupted = true;
                break;
            }
            let position = idx + 1;

            let source = match normalize_cell(raw) {
                Ok(source) => source,
                Err(reason) => {
                    debug!(position, %reason, "skipping recorded cell");
                    continue;
                }
            };

            let cell_id = resolver.resolve(&source);
            info!(cell_id, position, "about to run cell");
            if tracker.is_stale(cell_id) {
                summary.num_safety_errors += 1;
            }

            let exec_started = Instant::now();
            let request = ExecRequest::cell(cell_id, &source, tracked);
            let executed = execute_bounded(self.sandbox, &mut self.interrupt, request, timeout)
                .await
                .map_err(|source| ReplayError::Sandbox { cell_id, source })?;
            summary.tracer_time += exec_started.elapsed().as_secs_f64();

            let fault = match executed {
                Executed::Finished(outcome) => {
                    if outcome.violation {
                        warn!(cell_id, position, "analyzer flagged a staleness violation");
                    }
                    outcome.exception
                }
                Executed::TimedOut => {
                    warn!(cell_id, position, ?timeout, "cell timed out");
                    self.sandbox
                        .interrupt()
                        .await
                        .map_err(|source| ReplayError::Sandbox { cell_id, source })?;
                    Some(TIMEOUT_FAULT.to_string())
                }
                Executed::Interrupted => {
                    warn!(cell_id, position, "replay interrupted during execution");
                    if let Err(e) = self.sandbox.interrupt().await {
                        warn!(error = %e, "sandbox did not stop cleanly");
                    }
                    summary.interrupted = true;
                    break;
                }
            };

            summary.num_cell_execs += 1;
            match &fault {
                Some(kind) => {
                    error!(cell_id, position, exception = %kind, "cell raised");
                    summary.record_fault(kind);
                }
                None => summary.num_successful_cell_execs += 1,
            }

            let mut scored = false;
            if tracked
                && fault.is_none()
                && let Some(previous) = tracker.last_cell()
                && let Some(deltas) = tracker.deltas_for(cell_id)
            {
                scored = stats.record(cell_id, previous, &deltas, tracker.state(), &mut rng);
            }

            tracker.begin_step(cell_id, source);
            if tracked {
                let check_started = Instant::now();
                let analysis = self
                    .analyzer
                    .analyze(tracker.state(), options)
                    .await
                    .map_err(|source| ReplayError::Analyzer { cell_id, source })?;
                summary.checker_time += check_started.elapsed().as_secs_f64();
                tracker.absorb(analysis);
            }

            summary.steps.push(StepRecord {
                position,
                cell_id,
                fault,
                scored,
            });
        }

        summary.num_cells_created = resolver.cells_created();
        summary.wall_time = started.elapsed().as_secs_f64();
        summary.metrics = stats.finalize();

        if summary.interrupted {
            warn!(%key, steps = summary.steps.len(), "replay interrupted; summary is partial");
        }
        if summary.had_safety_errors() {
            warn!(%key, "session had {} safety errors", summary.num_safety_errors);
        } else {
            info!(%key, "no safety errors detected in session");
        }
        Ok(summary)
    }

    /// Run the configured prelude. Returns `false` if interrupted.
    async fn run_prelude(&mut self, timeout: Duration) -> Result<bool> {
        for source in &self.config.prelude {
            let executed =
                execute_bounded(self.sandbox, &mut self.interrupt, ExecRequest::setup(source), timeout)
                    .await
                    .map_err(ReplayError::Prelude)?;
            match executed {
                Executed::Finished(outcome) => {
                    if let Some(kind) = outcome.exception {
                        warn!(source = %source, exception = %kind, "prelude raised");
                    }
                }
                Executed::TimedOut => {
                    warn!(source = %source, "prelude timed out");
                    self.sandbox.interrupt().await.map_err(ReplayError::Prelude)?;
                }
                Executed::Interrupted => return Ok(false),
            }
        }
        Ok(true)
    }
}

async fn execute_bounded<S: ExecutionSandbox>(
    sandbox: &S,
    interrupt: &mut Interrupt,
    request: ExecRequest<'_>,
    timeout: Duration,
) -> std::result::Result<Executed, CollabError> {
    tokio::select! {
        biased;
        _ = interrupt.triggered() => Ok(Executed::Interrupted),
        res = tokio::time::timeout(timeout, sandbox.execute(request)) => match res {
            Ok(outcome) => outcome.map(Executed::Finished),
            Err(_) => Ok(Executed::TimedOut),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FnAnalyzer, ScriptedSandbox};
    use nbreplay::Analysis;

    fn config() -> ReplayConfig {
        ReplayConfig {
            seed: Some(5),
            prelude: Vec::new(),
            ..ReplayConfig::default()
        }
    }

    fn cells(sources: &[&str]) -> Vec<String> {
        sources.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_skips_cells_that_normalize_to_nothing() {
        let sandbox = ScriptedSandbox::new();
        let analyzer = FnAnalyzer::empty();
        let mut replayer = Replayer::new(config(), &sandbox, &analyzer);
        let summary = replayer
            .replay(
                SessionKey::new(1, 1, 0),
                &cells(&["x = 1", "# just a note", "get_ipython().magic('who')", "y = x"]),
            )
            .await
            .unwrap();
        assert_eq!(summary.num_cell_execs, 2);
        assert_eq!(summary.num_cells_created, 2);
        let positions: Vec<usize> = summary.steps.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 4]);
        assert_eq!(sandbox.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_prelude_runs_untracked_first() {
        let sandbox = ScriptedSandbox::new();
        let analyzer = FnAnalyzer::empty();
        let config = ReplayConfig {
            prelude: vec!["import numpy as np".to_string()],
            ..config()
        };
        let mut replayer = Replayer::new(config, &sandbox, &analyzer);
        let summary = replayer
            .replay(SessionKey::new(1, 1, 0), &cells(&["a = np.zeros(3)"]))
            .await
            .unwrap();

        let calls = sandbox.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cell_id, None);
        assert!(!calls[0].tracked);
        assert_eq!(calls[1].cell_id, Some(0));
        assert!(calls[1].tracked);
        assert_eq!(summary.num_cell_execs, 1);
    }

    #[tokio::test]
    async fn test_sandbox_failure_aborts() {
        let sandbox = ScriptedSandbox::new().break_when("boom");
        let analyzer = FnAnalyzer::empty();
        let mut replayer = Replayer::new(config(), &sandbox, &analyzer);
        let err = replayer
            .replay(SessionKey::new(1, 1, 0), &cells(&["a = 1", "boom()", "c = 3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Sandbox { cell_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let sandbox = ScriptedSandbox::new();
        let analyzer = FnAnalyzer::empty();
        let config = ReplayConfig {
            similarity_threshold: 2.0,
            ..config()
        };
        let mut replayer = Replayer::new(config, &sandbox, &analyzer);
        let err = replayer
            .replay(SessionKey::new(1, 1, 0), &cells(&["a = 1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Config(_)));
        assert!(sandbox.calls().is_empty());
    }

    #[tokio::test]
    async fn test_violation_does_not_count_as_fault() {
        let sandbox = ScriptedSandbox::new().flag_violation_when("b");
        let analyzer = FnAnalyzer::new(|notebook, _| {
            Ok(Analysis {
                fresh_cells: notebook.keys().copied().collect(),
                ..Analysis::default()
            })
        });
        let mut replayer = Replayer::new(config(), &sandbox, &analyzer);
        let summary = replayer
            .replay(SessionKey::new(1, 1, 0), &cells(&["a = 1", "b = a"]))
            .await
            .unwrap();
        assert_eq!(summary.num_exceptions, 0);
        assert_eq!(summary.num_successful_cell_execs, 2);
    }
}

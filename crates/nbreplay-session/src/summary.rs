use chrono::{DateTime, Utc};
use nbreplay::CellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one replay of one recorded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub trace: i64,
    pub session: i64,
    /// Experiment version; replays with the same version overwrite each other.
    pub version: i64,
}

impl SessionKey {
    pub fn new(trace: i64, session: i64, version: i64) -> Self {
        Self {
            trace,
            session,
            version,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trace {} session {} (version {})",
            self.trace, self.session, self.version
        )
    }
}

/// One replayed step, kept for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position among the recorded cells, counting skipped ones.
    pub position: usize,
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    /// Whether the step fed the statistics accumulators.
    pub scored: bool,
}

/// The outcome of one replay session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub key: SessionKey,
    pub num_cell_execs: u64,
    pub num_successful_cell_execs: u64,
    pub num_cells_created: u64,
    pub num_exceptions: u64,
    pub num_safety_errors: u64,
    /// Seconds spent executing cells.
    pub tracer_time: f64,
    /// Seconds spent in the dependency analyzer.
    pub checker_time: f64,
    pub wall_time: f64,
    /// The session stopped before every recorded cell was replayed.
    pub interrupted: bool,
    pub replayed_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub exception_counts: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
}

impl SessionSummary {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            num_cell_execs: 0,
            num_successful_cell_execs: 0,
            num_cells_created: 0,
            num_exceptions: 0,
            num_safety_errors: 0,
            tracer_time: 0.0,
            checker_time: 0.0,
            wall_time: 0.0,
            interrupted: false,
            replayed_at: Utc::now(),
            metrics: BTreeMap::new(),
            exception_counts: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn record_fault(&mut self, kind: &str) {
        self.num_exceptions += 1;
        *self.exception_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn had_safety_errors(&self) -> bool {
        self.num_safety_errors > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fault_counts_by_kind() {
        let mut summary = SessionSummary::new(SessionKey::new(1, 2, -1));
        summary.record_fault("NameError");
        summary.record_fault("NameError");
        summary.record_fault("TimeoutError");
        assert_eq!(summary.num_exceptions, 3);
        assert_eq!(summary.exception_counts["NameError"], 2);
        assert_eq!(summary.exception_counts["TimeoutError"], 1);
    }

    #[test]
    fn test_summary_json_skips_empty_steps() {
        let summary = SessionSummary::new(SessionKey::new(1, 2, 0));
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("steps").is_none());
        assert_eq!(json["key"]["trace"], 1);
        let back: SessionSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn test_session_key_display() {
        assert_eq!(
            SessionKey::new(3, 4, -1).to_string(),
            "trace 3 session 4 (version -1)"
        );
    }
}

use serde::{Deserialize, Serialize};

/// Sources matching any of these `LIKE` patterns mark a session as
/// unreplayable: it depends on files, services or hardware a replay cannot
/// provide.
pub const DEFAULT_FILTER_PATTERNS: [&str; 21] = [
    "%get_ipython().magic(%run%",
    "%get_ipython().magic(%load%",
    "%get_ipython().run_line_magic(%run%",
    "%get_ipython().run_line_magic(%load%",
    "%pd.read_csv(%data%",
    "%keras%",
    "%subprocess%",
    "%shutil%",
    "%pyspark%",
    "%pyscopg2%",
    "%sqlite3%",
    "%mongo%",
    "%mysql%",
    "%cuda%",
    "%requests%",
    "%grader%",
    "%threading%",
    "%from magic import%",
    "%import magic%",
    "%plotly%",
    "%正常NST%",
];

/// Which recorded sessions are worth replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum highest cell counter of a session.
    pub min_cells: i64,
    pub filter_patterns: Vec<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_cells: 50,
            filter_patterns: DEFAULT_FILTER_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl SelectionConfig {
    pub fn with_min_cells(mut self, min_cells: i64) -> Self {
        self.min_cells = min_cells;
        self
    }

    pub fn without_filters(mut self) -> Self {
        self.filter_patterns.clear();
        self
    }
}

/// A session that passed selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub trace: i64,
    pub session: i64,
    pub num_cells: i64,
}

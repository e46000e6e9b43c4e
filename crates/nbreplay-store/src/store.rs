use crate::error::{Result, StoreError};
use crate::selection::{SelectionConfig, SessionRef};
use chrono::{DateTime, Utc};
use nbreplay::ReplayStats;
use nbreplay_session::{CollabError, SessionKey, SessionSummary, SummarySink};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cell_execs (
    trace INTEGER NOT NULL,
    session INTEGER NOT NULL,
    counter INTEGER NOT NULL,
    source TEXT NOT NULL,
    PRIMARY KEY (trace, session, counter)
);

CREATE TABLE IF NOT EXISTS bad_sessions (
    trace INTEGER NOT NULL,
    session INTEGER NOT NULL,
    PRIMARY KEY (trace, session)
);

CREATE TABLE IF NOT EXISTS replay_stats (
    version INTEGER NOT NULL,
    trace INTEGER NOT NULL,
    session INTEGER NOT NULL,
    num_cell_execs INTEGER NOT NULL,
    num_successful_cell_execs INTEGER NOT NULL,
    num_cells_created INTEGER NOT NULL,
    num_exceptions INTEGER NOT NULL,
    num_safety_errors INTEGER NOT NULL,
    tracer_time REAL NOT NULL,
    checker_time REAL NOT NULL,
    wall_time REAL NOT NULL,
    interrupted INTEGER NOT NULL DEFAULT 0,
    replayed_at TEXT,
    PRIMARY KEY (version, trace, session)
);

CREATE TABLE IF NOT EXISTS replay_exception_stats (
    trace INTEGER NOT NULL,
    session INTEGER NOT NULL,
    exception TEXT NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (trace, session, exception)
);
"#;

/// Columns of `replay_stats` that are not metrics.
const BASE_COLUMNS: [&str; 13] = [
    "version",
    "trace",
    "session",
    "num_cell_execs",
    "num_successful_cell_execs",
    "num_cells_created",
    "num_exceptions",
    "num_safety_errors",
    "tracer_time",
    "checker_time",
    "wall_time",
    "interrupted",
    "replayed_at",
];

/// SQLite store of recorded sessions and replay summaries.
///
/// Metric columns of `replay_stats` are added on demand, so summaries with
/// new metric names can be saved into an older database.
pub struct TraceStore {
    conn: Connection,
    metric_columns: BTreeSet<String>,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("metric_columns", &self.metric_columns.len())
            .finish_non_exhaustive()
    }
}

impl TraceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "opened trace store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        let mut store = Self {
            conn,
            metric_columns: BTreeSet::new(),
        };
        store.metric_columns = store.existing_metric_columns()?;
        store.ensure_metric_columns(ReplayStats::metric_names())?;
        Ok(store)
    }

    fn existing_metric_columns(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(replay_stats)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter(|n| !BASE_COLUMNS.contains(&n.as_str()))
            .collect())
    }

    fn ensure_metric_columns<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref();
            if self.metric_columns.contains(name) {
                continue;
            }
            if !is_valid_column(name) || BASE_COLUMNS.contains(&name) {
                return Err(StoreError::InvalidColumn(name.to_string()));
            }
            self.conn.execute(
                &format!("ALTER TABLE replay_stats ADD COLUMN {name} REAL"),
                [],
            )?;
            debug!(column = name, "added metric column");
            self.metric_columns.insert(name.to_string());
        }
        Ok(())
    }

    // ── Recorded sessions ───────────────────────────────────────────────

    /// Record the cells of a session, numbered from 1. Replaces any cells
    /// already stored under the same counters.
    pub fn import_session(&mut self, trace: i64, session: i64, cells: &[String]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cell_execs (trace, session, counter, source) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (idx, source) in cells.iter().enumerate() {
                stmt.execute(params![trace, session, idx as i64 + 1, source])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The recorded sources of a session in execution order.
    pub fn session_cells(&self, trace: i64, session: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT source FROM cell_execs WHERE trace = ?1 AND session = ?2 ORDER BY counter ASC",
        )?;
        let cells = stmt
            .query_map(params![trace, session], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(cells)
    }

    pub fn mark_bad_session(&self, trace: i64, session: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO bad_sessions (trace, session) VALUES (?1, ?2)",
            params![trace, session],
        )?;
        Ok(())
    }

    /// Sessions that are long enough, not marked bad, and free of sources
    /// matching any filter pattern.
    pub fn eligible_sessions(&self, selection: &SelectionConfig) -> Result<Vec<SessionRef>> {
        let mut sql = String::from(
            "SELECT c.trace, c.session, MAX(c.counter) FROM cell_execs c
             WHERE NOT EXISTS (
                 SELECT 1 FROM bad_sessions b WHERE b.trace = c.trace AND b.session = c.session
             )",
        );
        if !selection.filter_patterns.is_empty() {
            let likes: Vec<String> = (0..selection.filter_patterns.len())
                .map(|i| format!("f.source LIKE ?{}", i + 2))
                .collect();
            sql.push_str(&format!(
                "
             AND NOT EXISTS (
                 SELECT 1 FROM cell_execs f
                 WHERE f.trace = c.trace AND f.session = c.session AND ({})
             )",
                likes.join(" OR ")
            ));
        }
        sql.push_str(
            "
             GROUP BY c.trace, c.session
             HAVING MAX(c.counter) >= ?1
             ORDER BY c.trace, c.session",
        );

        let mut values = vec![Value::Integer(selection.min_cells)];
        values.extend(
            selection
                .filter_patterns
                .iter()
                .map(|p| Value::Text(p.clone())),
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(SessionRef {
                    trace: row.get(0)?,
                    session: row.get(1)?,
                    num_cells: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // ── Summaries ───────────────────────────────────────────────────────

    /// Upsert the summary row and replace the session's exception counts.
    pub fn save_summary(&mut self, summary: &SessionSummary) -> Result<()> {
        self.ensure_metric_columns(summary.metrics.keys())?;
        let key = summary.key;

        let mut columns: Vec<&str> = BASE_COLUMNS.to_vec();
        let mut values = vec![
            Value::Integer(key.version),
            Value::Integer(key.trace),
            Value::Integer(key.session),
            Value::Integer(summary.num_cell_execs as i64),
            Value::Integer(summary.num_successful_cell_execs as i64),
            Value::Integer(summary.num_cells_created as i64),
            Value::Integer(summary.num_exceptions as i64),
            Value::Integer(summary.num_safety_errors as i64),
            Value::Real(summary.tracer_time),
            Value::Real(summary.checker_time),
            Value::Real(summary.wall_time),
            Value::Integer(i64::from(summary.interrupted)),
            Value::Text(summary.replayed_at.to_rfc3339()),
        ];
        for (name, value) in &summary.metrics {
            columns.push(name);
            values.push(Value::Real(*value));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
        let upsert = format!(
            "INSERT OR REPLACE INTO replay_stats ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let tx = self.conn.transaction()?;
        tx.execute(&upsert, params_from_iter(values.iter()))?;
        tx.execute(
            "DELETE FROM replay_exception_stats WHERE trace = ?1 AND session = ?2",
            params![key.trace, key.session],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO replay_exception_stats (trace, session, exception, count) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (kind, count) in &summary.exception_counts {
                stmt.execute(params![key.trace, key.session, kind, *count as i64])?;
            }
        }
        tx.commit()?;
        debug!(%key, metrics = summary.metrics.len(), "saved replay summary");
        Ok(())
    }

    /// Load a saved summary. Per-step records are not persisted and come
    /// back empty.
    pub fn load_summary(&self, key: SessionKey) -> Result<Option<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM replay_stats WHERE version = ?1 AND trace = ?2 AND session = ?3",
        )?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();

        let row = stmt
            .query_row(params![key.version, key.trace, key.session], |row| {
                let mut summary = SessionSummary::new(key);
                summary.num_cell_execs = row.get::<_, i64>("num_cell_execs")? as u64;
                summary.num_successful_cell_execs =
                    row.get::<_, i64>("num_successful_cell_execs")? as u64;
                summary.num_cells_created = row.get::<_, i64>("num_cells_created")? as u64;
                summary.num_exceptions = row.get::<_, i64>("num_exceptions")? as u64;
                summary.num_safety_errors = row.get::<_, i64>("num_safety_errors")? as u64;
                summary.tracer_time = row.get("tracer_time")?;
                summary.checker_time = row.get("checker_time")?;
                summary.wall_time = row.get("wall_time")?;
                summary.interrupted = row.get("interrupted")?;
                for (idx, name) in names.iter().enumerate() {
                    if BASE_COLUMNS.contains(&name.as_str()) {
                        continue;
                    }
                    if let Some(value) = row.get::<_, Option<f64>>(idx)? {
                        summary.metrics.insert(name.clone(), value);
                    }
                }
                let replayed_at: Option<String> = row.get("replayed_at")?;
                Ok((summary, replayed_at))
            })
            .optional()?;

        let Some((mut summary, replayed_at)) = row else {
            return Ok(None);
        };
        if let Some(value) = replayed_at {
            summary.replayed_at = DateTime::parse_from_rfc3339(&value)
                .map_err(|source| StoreError::Timestamp {
                    value: value.clone(),
                    source,
                })?
                .with_timezone(&Utc);
        }
        summary.exception_counts = self.exception_counts(key.trace, key.session)?;
        Ok(Some(summary))
    }

    pub fn exception_counts(&self, trace: i64, session: i64) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT exception, count FROM replay_exception_stats WHERE trace = ?1 AND session = ?2",
        )?;
        let counts = stmt
            .query_map(params![trace, session], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    /// Number of summary rows stored for a session across all versions.
    pub fn summary_count(&self, trace: i64, session: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM replay_stats WHERE trace = ?1 AND session = ?2",
            params![trace, session],
            |row| row.get(0),
        )?)
    }
}

impl SummarySink for TraceStore {
    fn persist(&mut self, summary: &SessionSummary) -> std::result::Result<(), CollabError> {
        self.save_summary(summary)
            .map_err(|e| CollabError::Collaborator(e.to_string()))
    }
}

fn is_valid_column(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

//! Newline-delimited JSON messages exchanged with the kernel worker.
//!
//! Every request is one JSON object on one line, tagged by `op`; the worker
//! answers each with exactly one line. A non-null `error` in a reply means
//! the worker itself failed, as opposed to the executed code raising.

use crate::error::{KernelError, Result};
use nbreplay::{AnalyzeOptions, Analysis, CellId, CellSet, NotebookState};
use nbreplay_session::ExecOutcome;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request<'a> {
    Execute {
        cell_id: Option<CellId>,
        source: &'a str,
        tracked: bool,
    },
    Analyze {
        cells: &'a NotebookState,
        forward_only: bool,
        naive_refresher_computation: bool,
    },
    Shutdown,
}

impl<'a> Request<'a> {
    pub fn analyze(cells: &'a NotebookState, options: AnalyzeOptions) -> Self {
        Request::Analyze {
            cells,
            forward_only: options.order.is_forward_only(),
            naive_refresher_computation: options.naive_refresher_computation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecuteReply {
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub violation: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecuteReply {
    pub fn into_outcome(self) -> Result<ExecOutcome> {
        if let Some(error) = self.error {
            return Err(KernelError::Worker(error));
        }
        Ok(ExecOutcome {
            exception: self.exception,
            violation: self.violation,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AnalyzeReply {
    #[serde(default)]
    pub fresh_cells: CellSet,
    #[serde(default)]
    pub stale_cells: CellSet,
    #[serde(default)]
    pub refresher_links: BTreeMap<CellId, CellSet>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AnalyzeReply {
    pub fn into_analysis(self) -> Result<Analysis> {
        if let Some(error) = self.error {
            return Err(KernelError::Worker(error));
        }
        Ok(Analysis {
            fresh_cells: self.fresh_cells,
            stale_cells: self.stale_cells,
            refresher_links: self.refresher_links,
        })
    }
}

/// One request line, newline included.
pub fn encode(request: &Request<'_>) -> Result<String> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

//! Line filtering applied to a recorded cell before it is replayed.
//!
//! Recorded histories contain kernel directives and debugger calls that
//! either cannot run outside the original interactive session or would block
//! a replay. These lines are dropped; cells left without any code are not
//! replayed at all.

use thiserror::Error;

const KERNEL_DIRECTIVE_PREFIXES: [&str; 3] = ["get_ipython().", "ip.", "ipy."];
const DEBUGGER_PREFIXES: [&str; 4] = ["help(", "pdb.", "set_trace(", "ipdb."];

/// Why a recorded cell was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("cell is empty after filtering")]
    Empty,

    #[error("cell contains only comments after filtering")]
    CommentsOnly,
}

/// Filter a recorded cell, returning the source to replay.
///
/// Kernel directives (`get_ipython().`, `ip.`, `ipy.`) are dropped unless
/// they set up plotting (`pylab`) or timing (`time`, but not `timedelta`).
/// Debugger and help calls are always dropped. Remaining lines keep their
/// original indentation.
///
/// # Examples
///
/// ```
/// use nbreplay::normalize_cell;
///
/// let cell = "get_ipython().run_line_magic('load_ext', 'autoreload')\nx = 1";
/// assert_eq!(normalize_cell(cell).unwrap(), "x = 1");
/// ```
pub fn normalize_cell(source: &str) -> Result<String, NormalizeError> {
    let mut kept = Vec::new();
    let mut code_lines = 0usize;

    for line in source.lines() {
        let stripped = line.trim();
        if starts_with_any(stripped, &KERNEL_DIRECTIVE_PREFIXES) && !is_kept_directive(line) {
            continue;
        }
        if starts_with_any(stripped, &DEBUGGER_PREFIXES) {
            continue;
        }
        if !stripped.is_empty() && !stripped.starts_with('#') {
            code_lines += 1;
        }
        kept.push(line);
    }

    let normalized = kept.join("\n");
    if normalized.trim().is_empty() {
        return Err(NormalizeError::Empty);
    }
    if code_lines == 0 {
        return Err(NormalizeError::CommentsOnly);
    }
    Ok(normalized)
}

fn starts_with_any(text: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| text.starts_with(p))
}

fn is_kept_directive(line: &str) -> bool {
    line.contains("pylab") || (line.contains("time") && !line.contains("timedelta"))
}

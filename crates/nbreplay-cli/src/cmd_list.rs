use anyhow::Result;
use nbreplay_store::SelectionConfig;
use std::path::Path;

pub fn run(db: &Path, min_cells: i64, json: bool, pretty: bool) -> Result<()> {
    let store = crate::open_store(db)?;
    let sessions = store.eligible_sessions(&SelectionConfig::default().with_min_cells(min_cells))?;

    if json {
        let output = serde_json::json!({
            "min_cells": min_cells,
            "sessions": sessions,
        });
        return crate::print_json(&output, pretty);
    }

    println!("Sessions with at least {} cells:", min_cells);
    println!();
    if sessions.is_empty() {
        println!("  (none)");
    } else {
        for s in &sessions {
            println!("  trace {:>6}  session {:>6}  {:>5} cells", s.trace, s.session, s.num_cells);
        }
    }
    Ok(())
}

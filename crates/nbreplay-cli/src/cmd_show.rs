use anyhow::{Context, Result};
use nbreplay_session::SessionKey;
use std::path::Path;

pub fn run(db: &Path, trace: i64, session: i64, version: i64, pretty: bool) -> Result<()> {
    let store = crate::open_store(db)?;
    let key = SessionKey::new(trace, session, version);
    let summary = store
        .load_summary(key)?
        .with_context(|| format!("No summary stored for {}", key))?;
    crate::print_json(&summary, pretty)
}

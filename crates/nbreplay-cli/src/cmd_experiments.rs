use crate::cmd_replay::{ReplayOptions, replay_session, watch_ctrl_c};
use anyhow::Result;
use clap::Args;
use nbreplay_session::{SessionKey, interrupt_channel};
use nbreplay_store::SelectionConfig;
use std::path::Path;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ExperimentsArgs {
    /// Minimum number of recorded cells per session
    #[arg(long, default_value_t = 50)]
    pub min_cells: i64,

    /// Experiment version written with every summary
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub version: i64,

    #[command(flatten)]
    pub options: ReplayOptions,
}

pub async fn run(args: ExperimentsArgs, db: &Path) -> Result<()> {
    let config = args.options.build_config()?;
    let command = args.options.kernel_command();
    let mut store = crate::open_store(db)?;

    let selection = SelectionConfig::default().with_min_cells(args.min_cells);
    let sessions = store.eligible_sessions(&selection)?;
    info!(count = sessions.len(), min_cells = args.min_cells, "selected sessions");

    let (handle, interrupt) = interrupt_channel();
    let ctrl_c = watch_ctrl_c(move || handle.trigger());

    let total = sessions.len();
    let mut failed = 0usize;
    for (idx, session) in sessions.iter().enumerate() {
        if interrupt.is_triggered() {
            warn!(remaining = total - idx, "experiments interrupted");
            break;
        }
        info!(
            "Running trace {} session {} ({} of {} total)",
            session.trace,
            session.session,
            idx + 1,
            total
        );
        let key = SessionKey::new(session.trace, session.session, args.version);
        let result = replay_session(
            &command,
            config.clone(),
            key,
            &mut store,
            interrupt.clone(),
        )
        .await;
        if let Err(e) = result {
            warn!(%key, error = %format!("{e:#}"), "session failed");
            failed += 1;
        }
    }
    ctrl_c.abort();

    if failed > 0 {
        anyhow::bail!("{} of {} sessions failed", failed, total);
    }
    Ok(())
}

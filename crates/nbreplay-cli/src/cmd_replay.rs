use anyhow::{Context, Result};
use clap::Args;
use nbreplay_kernel::{KernelClient, KernelCommand};
use nbreplay_session::{
    Interrupt, ReplayConfig, Replayer, SessionKey, SessionSummary, interrupt_channel,
};
use nbreplay_store::TraceStore;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Which trace the session is in
    #[arg(short, long)]
    pub trace: i64,

    /// Which session to replay
    #[arg(short, long)]
    pub session: i64,

    /// Experiment version; replays with the same version overwrite each other
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub version: i64,

    #[command(flatten)]
    pub options: ReplayOptions,
}

/// Options shared by `replay` and `experiments`.
#[derive(Args, Debug, Default)]
pub struct ReplayOptions {
    /// TOML file with replay settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Kernel worker program
    #[arg(long)]
    pub kernel: Option<String>,

    /// Argument passed to the kernel worker (repeatable)
    #[arg(long = "kernel-arg", allow_hyphen_values = true)]
    pub kernel_args: Vec<String>,

    /// Only propagate staleness forwards
    #[arg(long)]
    pub forward_only_propagation: bool,

    /// Use the quadratic refresher computation
    #[arg(long)]
    pub naive_refresher_computation: bool,

    /// Execute cells without the analyzer and skip scoring
    #[arg(long)]
    pub untracked: bool,

    /// Do not write the summary to the database
    #[arg(long)]
    pub no_stats_logging: bool,

    /// Minimum similarity for a source to reuse an existing cell id
    #[arg(long)]
    pub similarity_threshold: Option<f64>,

    /// Per-cell execution timeout in seconds
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Seed for the random baselines
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ReplayOptions {
    pub fn build_config(&self) -> Result<ReplayConfig> {
        let mut config = match &self.config {
            Some(path) => ReplayConfig::load(path)
                .with_context(|| format!("Failed to load replay config {:?}", path))?,
            None => ReplayConfig::default(),
        };
        if self.forward_only_propagation {
            config.forward_only_propagation = true;
        }
        if self.naive_refresher_computation {
            config.naive_refresher_computation = true;
        }
        if self.untracked {
            config.tracked = false;
        }
        if self.no_stats_logging {
            config.persist_stats = false;
        }
        if let Some(threshold) = self.similarity_threshold {
            config.similarity_threshold = threshold;
        }
        if let Some(timeout) = self.timeout {
            config.execution_timeout_secs = timeout;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        config.validate().context("Invalid replay configuration")?;
        Ok(config)
    }

    pub fn kernel_command(&self) -> KernelCommand {
        match &self.kernel {
            Some(program) => KernelCommand::new(program).with_args(self.kernel_args.clone()),
            None if self.kernel_args.is_empty() => KernelCommand::default(),
            None => KernelCommand {
                args: self.kernel_args.clone(),
                ..KernelCommand::default()
            },
        }
    }
}

pub async fn run(args: ReplayArgs, db: &Path, pretty: bool) -> Result<()> {
    let config = args.options.build_config()?;
    let mut store = crate::open_store(db)?;
    let key = SessionKey::new(args.trace, args.session, args.version);

    let (handle, interrupt) = interrupt_channel();
    let ctrl_c = watch_ctrl_c(move || handle.trigger());

    let result = replay_session(
        &args.options.kernel_command(),
        config,
        key,
        &mut store,
        interrupt,
    )
    .await;
    ctrl_c.abort();

    let summary = result?;
    crate::print_json(&summary, pretty)
}

/// Replay one stored session in a fresh kernel worker.
pub async fn replay_session(
    command: &KernelCommand,
    config: ReplayConfig,
    key: SessionKey,
    store: &mut TraceStore,
    interrupt: Interrupt,
) -> Result<SessionSummary> {
    let cells = store.session_cells(key.trace, key.session)?;
    if cells.is_empty() {
        anyhow::bail!(
            "No recorded cells for trace {} session {}",
            key.trace,
            key.session
        );
    }

    let kernel = KernelClient::spawn(command.clone())
        .with_context(|| format!("Failed to start kernel worker {:?}", command.program))?;

    let result = Replayer::new(config, &kernel, &kernel)
        .with_interrupt(interrupt)
        .replay_and_persist(key, &cells, store)
        .await
        .with_context(|| format!("Replay of {} failed", key));

    if let Err(e) = kernel.shutdown().await {
        warn!(error = %e, "kernel worker did not shut down cleanly");
    }
    result
}

/// Call `on_interrupt` once on Ctrl-C.
pub fn watch_ctrl_c<F>(on_interrupt: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing with partial statistics");
            on_interrupt();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "similarity_threshold = 0.9\nexecution_timeout_secs = 30").unwrap();

        let options = ReplayOptions {
            config: Some(file.path().to_path_buf()),
            timeout: Some(5.0),
            untracked: true,
            ..ReplayOptions::default()
        };
        let config = options.build_config().unwrap();
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.execution_timeout_secs, 5.0);
        assert!(!config.tracked);
        assert!(config.persist_stats);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let options = ReplayOptions {
            similarity_threshold: Some(1.5),
            ..ReplayOptions::default()
        };
        assert!(options.build_config().is_err());
    }

    #[test]
    fn test_kernel_command() {
        assert_eq!(ReplayOptions::default().kernel_command(), KernelCommand::default());

        let options = ReplayOptions {
            kernel: Some("/opt/worker".into()),
            kernel_args: vec!["--fast".into()],
            ..ReplayOptions::default()
        };
        let command = options.kernel_command();
        assert_eq!(command.program, "/opt/worker");
        assert_eq!(command.args, vec!["--fast".to_string()]);

        let options = ReplayOptions {
            kernel_args: vec!["-X".into(), "dev".into()],
            ..ReplayOptions::default()
        };
        let command = options.kernel_command();
        assert_eq!(command.program, "python3");
        assert_eq!(command.args, vec!["-X".to_string(), "dev".to_string()]);
    }
}

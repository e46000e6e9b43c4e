mod cmd_experiments;
mod cmd_list;
mod cmd_replay;
mod cmd_show;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nbreplay_store::TraceStore;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "nbreplay")]
#[command(about = "Replay recorded notebook sessions and score staleness predictions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Trace database
    #[arg(long, global = true, default_value = "./data/traces.sqlite")]
    db: PathBuf,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay one recorded session
    Replay(cmd_replay::ReplayArgs),
    /// Replay every eligible session, one after another
    Experiments(cmd_experiments::ExperimentsArgs),
    /// List sessions eligible for replay
    List {
        /// Minimum number of recorded cells
        #[arg(long, default_value_t = 50)]
        min_cells: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a persisted replay summary
    Show {
        #[arg(short, long)]
        trace: i64,

        #[arg(short, long)]
        session: i64,

        /// Experiment version
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        version: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Replay(args) => cmd_replay::run(args, &cli.db, cli.pretty).await,
        Commands::Experiments(args) => cmd_experiments::run(args, &cli.db).await,
        Commands::List { min_cells, json } => cmd_list::run(&cli.db, min_cells, json, cli.pretty),
        Commands::Show {
            trace,
            session,
            version,
        } => cmd_show::run(&cli.db, trace, session, version, cli.pretty),
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {:?}", path))?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init()?;
        }
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}

pub(crate) fn open_store(db: &Path) -> Result<TraceStore> {
    if let Some(parent) = db.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    TraceStore::open(db).with_context(|| format!("Failed to open trace database {:?}", db))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}

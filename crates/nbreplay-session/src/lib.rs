#![doc = include_str!("../README.md")]

pub mod collab;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod replay;
pub mod summary;
pub mod testing;

pub use collab::{DependencyAnalyzer, ExecOutcome, ExecRequest, ExecutionSandbox, SummarySink};
pub use config::ReplayConfig;
pub use error::{CollabError, ConfigError, ReplayError, Result};
pub use interrupt::{Interrupt, InterruptHandle, interrupt_channel};
pub use replay::{Replayer, TIMEOUT_FAULT};
pub use summary::{SessionKey, SessionSummary, StepRecord};

#![doc = include_str!("../README.md")]

pub mod error;
pub mod selection;
pub mod store;

pub use error::{Result, StoreError};
pub use selection::{DEFAULT_FILTER_PATTERNS, SelectionConfig, SessionRef};
pub use store::TraceStore;

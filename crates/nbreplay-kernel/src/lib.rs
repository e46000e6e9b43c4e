#![doc = include_str!("../README.md")]

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{KernelClient, KernelCommand};
pub use error::{KernelError, Result};

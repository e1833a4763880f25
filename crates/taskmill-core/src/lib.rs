//! Shared configuration and error types for the taskmill workspace.

pub mod config;
pub mod error;

pub use config::{IntervalSpec, StoreKind, TaskConfig, TaskmillConfig};
pub use error::{Result, TaskmillError};

//! # Warden Core
//!
//! Shared error taxonomy and configuration used by every Warden crate.

pub mod config;
pub mod error;

pub use config::{GatewayConfig, RetryConfig, SchedulerConfig, TaskConfig, WardenConfig};
pub use error::{Result, WardenError};

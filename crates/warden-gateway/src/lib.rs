//! # Warden Gateway
//!
//! HTTP admin API over a running scheduler: list tasks, read history,
//! enable/disable, trigger, and edit schedules.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};

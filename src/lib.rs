//! Command-line supervisor for the code analysis server.
//!
//! The process supervision and database RPC live in the `analysis_daemon`
//! crate; this crate adds configuration loading and the worker processes.

pub mod config;
pub mod workers;

pub use config::SupervisorConfig;

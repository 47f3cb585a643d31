//! Infrastructure layer for Sagaflow.
//!
//! Contains implementations of the repository traits defined in `sagaflow-core`
//! and the `config.toml` loader.

pub mod config;
pub mod memory;

//! Shared domain types for Sagaflow.
//!
//! This crate contains the plain data types used across the Sagaflow
//! workspace: execution records and snapshots, scheduled job descriptions,
//! lifecycle events, configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod schedule;
pub mod workflow;

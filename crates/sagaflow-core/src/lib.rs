//! Workflow/saga orchestration core for Sagaflow.
//!
//! This crate holds the engine logic and the "ports" (repository and service
//! bridge traits) that infrastructure implements. It depends only on
//! `sagaflow-types` -- never on `sagaflow-infra` or any storage crate.

pub mod clock;
pub mod event;
pub mod repository;
pub mod workflow;

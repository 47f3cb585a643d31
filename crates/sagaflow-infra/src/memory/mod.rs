//! In-memory storage backends.

pub mod execution;

pub use execution::InMemoryExecutionRepository;

//! Core types, traits, and error definitions for sandgate.
//!
//! This crate provides the foundational building blocks shared across the
//! agent: the error taxonomy, configuration, resource limits, control-plane
//! message payloads, the capability traits implemented by the backend and
//! bus crates, and mock implementations for testing.

pub mod config;
pub mod error;
pub mod limits;
pub mod messages;
pub mod mocks;
pub mod traits;
pub mod types;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use limits::TaskLimits;
pub use types::{ContainerInfo, JobInfo, MappedPort, Reservation, ShellCommand, TaskExit};

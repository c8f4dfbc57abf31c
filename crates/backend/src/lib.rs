//! Container backend implementations.
//!
//! The only production backend is Docker, driven through `bollard`. The
//! trait surface it implements lives in `sandgate_core::traits` so the
//! agent and gateway can be tested against in-memory fakes.

pub mod docker;

pub use docker::{DockerBackend, DockerBackendConfig};

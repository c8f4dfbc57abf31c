//! Core capability traits implemented by the backend, bus, and router
//! collaborators. Test doubles for all of them live in [`crate::mocks`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ContainerInfo, JobInfo, MappedPort, Reservation, ShellCommand};

/// One isolated execution environment provided by the container runtime.
#[async_trait]
pub trait Container: Send + Sync {
    /// Stable opaque handle, usable in logs and for path construction.
    fn id(&self) -> &str;

    /// Tear the container down. Destroying a handle the backend has
    /// already forgotten surfaces `BackendRejected`, never a panic.
    async fn destroy(&self) -> Result<()>;

    /// Run a one-shot command inside the container and report its exit
    /// status.
    async fn run(&self, command: &str) -> Result<JobInfo>;

    /// Map a host-reachable port into the container, returning the
    /// externally dialable port number.
    async fn open_inbound_port(&self) -> Result<MappedPort>;

    async fn limit_memory(&self, bytes: u64) -> Result<()>;

    async fn limit_disk(&self, bytes: u64) -> Result<()>;

    /// Currently enforced limits as reported by the runtime.
    async fn info(&self) -> Result<ContainerInfo>;
}

/// Factory and host-side view of the container runtime.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Provision a fresh container with no limits applied yet.
    async fn provide(&self) -> Result<Arc<dyn Container>>;

    /// Host command whose pseudo-terminal yields an interactive shell
    /// inside `container`.
    fn shell_command(&self, container: &dyn Container) -> ShellCommand;

    /// Memory/disk committed to every live container. Entries the backend
    /// cannot read are skipped and logged by the implementation; they do
    /// not fail the whole call.
    async fn reservations(&self) -> Result<Vec<Reservation>>;
}

/// Topic-based pub/sub transport carrying the control plane.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a subject. Messages arrive on the returned channel
    /// until the bus connection closes.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
}

/// External routing collaborator announced to when tasks start and stop.
/// Every successful `register` is paired with exactly one `unregister`.
#[async_trait]
pub trait RouterRegistrar: Send + Sync {
    /// Announce that `task_id` is reachable through the gateway `port`.
    async fn register(&self, task_id: &str, port: MappedPort) -> Result<()>;

    async fn unregister(&self, task_id: &str) -> Result<()>;
}

//! The agent control loop.
//!
//! All registry mutations flow through one mpsc channel and are handled
//! sequentially, so a start, a stop, and a reap for the same task id can
//! never interleave. Callers interact through [`AgentHandle`], which
//! submits commands and awaits the reply on a oneshot channel.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use sandgate_core::error::{Error, Result};
use sandgate_core::limits::TaskLimits;
use sandgate_core::traits::{Container, ContainerBackend, RouterRegistrar};
use sandgate_core::types::MappedPort;

use crate::registry::Registry;
use crate::snapshot::SnapshotWriter;
use crate::task::Task;

const COMMAND_CAPACITY: usize = 64;

enum Command {
    Start {
        id: String,
        token: String,
        limits: TaskLimits,
        public_key: Option<String>,
        reply: oneshot::Sender<Result<Arc<Task>>>,
    },
    Stop {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Reap {
        id: String,
    },
}

/// Owns the command receiver; created once and consumed by [`Agent::run`].
pub struct Agent {
    commands: mpsc::Receiver<Command>,
    inner: AgentInner,
}

struct AgentInner {
    id: Uuid,
    registry: Arc<Registry>,
    backend: Arc<dyn ContainerBackend>,
    registrar: Option<Arc<dyn RouterRegistrar>>,
    gateway_port: u16,
    snapshot: SnapshotWriter,
    reap_tx: mpsc::Sender<String>,
}

/// Cloneable entry point into the control loop.
#[derive(Clone)]
pub struct AgentHandle {
    agent_id: Uuid,
    registry: Arc<Registry>,
    commands: mpsc::Sender<Command>,
}

impl Agent {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        registry: Arc<Registry>,
        gateway_port: u16,
        state_file: Option<PathBuf>,
    ) -> (Self, AgentHandle) {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (reap_tx, mut reap_rx) = mpsc::channel::<String>(COMMAND_CAPACITY);

        // Exiting task processes report through the reap channel; forward
        // them into the command stream so they serialize with starts and
        // stops.
        let reap_commands = command_tx.clone();
        tokio::spawn(async move {
            while let Some(task_id) = reap_rx.recv().await {
                if reap_commands.send(Command::Reap { id: task_id }).await.is_err() {
                    break;
                }
            }
        });

        let handle = AgentHandle {
            agent_id: id,
            registry: registry.clone(),
            commands: command_tx,
        };
        let agent = Self {
            commands: command_rx,
            inner: AgentInner {
                id,
                registry,
                backend,
                registrar: None,
                gateway_port,
                snapshot: SnapshotWriter::new(state_file),
                reap_tx,
            },
        };
        (agent, handle)
    }

    /// Announce task start/stop to an external router.
    pub fn with_registrar(mut self, registrar: Arc<dyn RouterRegistrar>) -> Self {
        self.inner.registrar = Some(registrar);
        self
    }

    /// Run the control loop until every [`AgentHandle`] is dropped.
    pub async fn run(self) {
        let Agent {
            mut commands,
            inner,
        } = self;
        tracing::info!(agent_id = %inner.id, "agent control loop started");
        while let Some(command) = commands.recv().await {
            inner.handle(command).await;
        }
        tracing::info!(agent_id = %inner.id, "agent control loop stopped");
    }
}

impl AgentInner {
    async fn handle(&self, command: Command) {
        match command {
            Command::Start {
                id,
                token,
                limits,
                public_key,
                reply,
            } => {
                let result = self
                    .handle_start(&id, token, limits, public_key.as_deref())
                    .await;
                if let Err(e) = &result {
                    tracing::warn!(task = %id, error = %e, "task start failed");
                }
                let _ = reply.send(result);
            }
            Command::Stop { id, reply } => {
                let _ = reply.send(self.handle_stop(&id).await);
            }
            Command::Reap { id } => self.handle_reap(&id).await,
        }
    }

    async fn handle_start(
        &self,
        id: &str,
        token: String,
        limits: TaskLimits,
        public_key: Option<&str>,
    ) -> Result<Arc<Task>> {
        if !limits.is_valid() {
            return Err(Error::limit_invalid(format!(
                "task {id}: memory and disk limits must both be positive"
            )));
        }
        // Refuse duplicates before touching the backend.
        if self.registry.contains(id) {
            return Err(Error::already_registered(id));
        }

        let container = provision_container(self.backend.as_ref(), limits).await?;

        let port = match prepare_task(container.as_ref(), public_key).await {
            Ok(port) => port,
            Err(e) => {
                destroy_quietly(container.as_ref(), id).await;
                return Err(e);
            }
        };

        let shell = self.backend.shell_command(container.as_ref());
        let task = Task::new(
            id.to_string(),
            token,
            limits,
            container.clone(),
            port,
            shell,
            self.reap_tx.clone(),
        );

        if let Err(e) = self.registry.register(task.clone()) {
            destroy_quietly(container.as_ref(), id).await;
            return Err(e);
        }

        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.register(id, self.gateway_port).await {
                tracing::warn!(task = %id, error = %e, "router registration failed");
            }
        }

        self.snapshot.write(self.id, &self.registry).await;
        tracing::info!(task = %id, container = %task.container_id(), port, "task started");
        Ok(task)
    }

    async fn handle_stop(&self, id: &str) -> Result<()> {
        let task = self.registry.unregister(id)?;
        self.finish_removal(id).await;
        task.shutdown().await?;
        tracing::info!(task = %id, "task stopped");
        Ok(())
    }

    async fn handle_reap(&self, id: &str) {
        match self.registry.unregister(id) {
            Ok(_) => {
                self.finish_removal(id).await;
                tracing::info!(task = %id, "task reaped after process exit");
            }
            // A concurrent stop already removed it.
            Err(_) => tracing::debug!(task = %id, "reap found task already unregistered"),
        }
    }

    async fn finish_removal(&self, id: &str) {
        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.unregister(id).await {
                tracing::warn!(task = %id, error = %e, "router unregistration failed");
            }
        }
        self.snapshot.write(self.id, &self.registry).await;
    }
}

/// Provision a container and apply the requested limits, tearing the
/// container down again if any limit is refused. A zero sub-limit skips
/// that dimension entirely.
pub(crate) async fn provision_container(
    backend: &dyn ContainerBackend,
    limits: TaskLimits,
) -> Result<Arc<dyn Container>> {
    let container = backend.provide().await?;
    if let Err(e) = apply_limits(container.as_ref(), limits).await {
        destroy_quietly(container.as_ref(), container.id()).await;
        return Err(e);
    }
    Ok(container)
}

async fn apply_limits(container: &dyn Container, limits: TaskLimits) -> Result<()> {
    if limits.memory_limit_bytes > 0 {
        container.limit_memory(limits.memory_limit_bytes).await?;
    }
    if limits.disk_limit_bytes > 0 {
        container.limit_disk(limits.disk_limit_bytes).await?;
    }
    Ok(())
}

/// Map the inbound port and install the session public key, if any.
async fn prepare_task(container: &dyn Container, public_key: Option<&str>) -> Result<MappedPort> {
    let port = container.open_inbound_port().await?;
    if let Some(key) = public_key {
        let command = format!("mkdir -p ~/.ssh && echo '{key}' >> ~/.ssh/authorized_keys");
        let job = container.run(&command).await?;
        if job.exit_status != 0 {
            return Err(Error::backend_rejected(format!(
                "installing public key exited {}",
                job.exit_status
            )));
        }
    }
    Ok(port)
}

async fn destroy_quietly(container: &dyn Container, task_id: &str) {
    if let Err(e) = container.destroy().await {
        tracing::warn!(task = %task_id, error = %e, "compensating container destroy failed");
    }
}

impl AgentHandle {
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn lookup(&self, task_id: &str) -> Option<Arc<Task>> {
        self.registry.lookup(task_id)
    }

    pub async fn start_task(
        &self,
        id: String,
        token: String,
        limits: TaskLimits,
        public_key: Option<String>,
    ) -> Result<Arc<Task>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start {
                id,
                token,
                limits,
                public_key,
                reply,
            })
            .await
            .map_err(|_| Error::internal("agent control loop stopped"))?;
        response
            .await
            .map_err(|_| Error::internal("agent control loop stopped"))?
    }

    pub async fn stop_task(&self, id: String) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { id, reply })
            .await
            .map_err(|_| Error::internal("agent control loop stopped"))?;
        response
            .await
            .map_err(|_| Error::internal("agent control loop stopped"))?
    }
}

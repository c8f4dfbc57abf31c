//! Docker container backend.
//!
//! Provisions one container per task with a tmpfs-backed workspace, strict
//! security defaults, and an SSH port published on an ephemeral host port.
//! Memory limits map to cgroup updates; disk limits remount the workspace
//! tmpfs to the requested size.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use sandgate_core::error::{Error, Result};
use sandgate_core::traits::{Container, ContainerBackend};
use sandgate_core::types::{ContainerInfo, JobInfo, MappedPort, Reservation, ShellCommand};

const MANAGED_BY_LABEL: &str = "managed-by";
const MANAGED_BY_VALUE: &str = "sandgate";
const SSH_PORT_KEY: &str = "22/tcp";
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Backend-level settings, derived from the agent configuration.
#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Image every task container is created from.
    pub image: String,
    /// Writable tmpfs mount point inside the container.
    pub workdir: String,
    /// Interactive shell launched for attached sessions.
    pub shell: String,
    /// Initial tmpfs size before any disk limit is applied.
    pub workspace_bytes: u64,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            image: "sandgate-task:latest".to_string(),
            workdir: "/workspace".to_string(),
            shell: "/bin/bash".to_string(),
            workspace_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Docker-based [`ContainerBackend`] using the `bollard` crate.
pub struct DockerBackend {
    docker: bollard::Docker,
    config: DockerBackendConfig,
    socket: Option<String>,
    // Disk limits are remounts, which container inspection cannot report
    // back; the backend keeps its own ledger keyed by handle.
    disk_ledger: Arc<Mutex<HashMap<String, u64>>>,
}

impl DockerBackend {
    /// Connect to the local Docker daemon using its default socket.
    pub fn new(config: DockerBackendConfig) -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| Error::backend_unavailable(format!("docker connect: {e}")))?;
        Ok(Self {
            docker,
            config,
            socket: None,
            disk_ledger: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Connect through an explicit Unix socket path.
    pub fn with_socket(config: DockerBackendConfig, socket: &str) -> Result<Self> {
        let docker = bollard::Docker::connect_with_socket(
            socket,
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| Error::backend_unavailable(format!("docker connect {socket}: {e}")))?;
        Ok(Self {
            docker,
            config,
            socket: Some(socket.to_string()),
            disk_ledger: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

fn map_docker_err(handle: &str, err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::backend_rejected(format!("unknown handle: {handle}")),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => Error::backend_rejected(format!("{handle}: {status_code} {message}")),
        other => Error::backend_unavailable(other.to_string()),
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn provide(&self) -> Result<Arc<dyn Container>> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};

        let handle = format!("sandgate-{}", uuid::Uuid::new_v4());

        let host_config = HostConfig {
            // Writable scratch space only; everything else stays pristine.
            mounts: Some(vec![Mount {
                target: Some(self.config.workdir.clone()),
                typ: Some(MountTypeEnum::TMPFS),
                tmpfs_options: Some(bollard::models::MountTmpfsOptions {
                    size_bytes: Some(self.config.workspace_bytes as i64),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(256),
            port_bindings: Some(HashMap::from([(
                SSH_PORT_KEY.to_string(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    // Empty means "pick an ephemeral port".
                    host_port: Some(String::new()),
                }]),
            )])),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            working_dir: Some(self.config.workdir.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            exposed_ports: Some(HashMap::from([(
                SSH_PORT_KEY.to_string(),
                HashMap::<(), ()>::new(),
            )])),
            labels: Some(HashMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: handle.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| map_docker_err(&handle, e))?;

        if let Err(e) = self.docker.start_container::<String>(&handle, None).await {
            // Never leave a created-but-unstarted container behind.
            let _ = self
                .docker
                .remove_container(
                    &handle,
                    Some(bollard::container::RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(map_docker_err(&handle, e));
        }

        tracing::info!(handle = %handle, image = %self.config.image, "container provisioned");

        Ok(Arc::new(DockerContainer {
            docker: self.docker.clone(),
            handle,
            workdir: self.config.workdir.clone(),
            disk_limit_bytes: AtomicU64::new(0),
            disk_ledger: self.disk_ledger.clone(),
        }))
    }

    fn shell_command(&self, container: &dyn Container) -> ShellCommand {
        ShellCommand {
            program: "docker".to_string(),
            args: exec_args(self.socket.as_deref(), container.id(), &self.config.shell),
        }
    }

    async fn reservations(&self) -> Result<Vec<Reservation>> {
        use bollard::container::ListContainersOptions;

        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::backend_unavailable(format!("list containers: {e}")))?;

        let mut reservations = Vec::with_capacity(containers.len());
        for summary in containers {
            let Some(names) = summary.names else { continue };
            let Some(handle) = names.first().map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };

            let inspect = match self.docker.inspect_container(&handle, None).await {
                Ok(inspect) => inspect,
                Err(e) => {
                    // A container can disappear between list and inspect.
                    tracing::warn!(handle = %handle, error = %e, "skipping unreadable container");
                    continue;
                }
            };
            let memory_bytes = inspect
                .host_config
                .and_then(|hc| hc.memory)
                .unwrap_or(0)
                .max(0) as u64;
            let disk_bytes = self
                .disk_ledger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&handle)
                .copied()
                .unwrap_or(self.config.workspace_bytes);

            reservations.push(Reservation {
                handle,
                memory_bytes,
                disk_bytes,
            });
        }
        Ok(reservations)
    }
}

/// One task container managed through the Docker API.
pub struct DockerContainer {
    docker: bollard::Docker,
    handle: String,
    workdir: String,
    disk_limit_bytes: AtomicU64,
    disk_ledger: Arc<Mutex<HashMap<String, u64>>>,
}

impl DockerContainer {
    async fn exec_collect(&self, command: &str) -> Result<i64> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                &self.handle,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                if let Err(e) = chunk {
                    tracing::debug!(handle = %self.handle, error = %e, "exec stream error");
                    break;
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn id(&self) -> &str {
        &self.handle
    }

    async fn destroy(&self) -> Result<()> {
        use bollard::container::{RemoveContainerOptions, StopContainerOptions};

        let _ = self
            .docker
            .stop_container(&self.handle, Some(StopContainerOptions { t: 5 }))
            .await;

        self.docker
            .remove_container(
                &self.handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;

        self.disk_ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.handle);

        tracing::info!(handle = %self.handle, "container destroyed");
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<JobInfo> {
        let exit_code = self.exec_collect(command).await?;
        Ok(JobInfo {
            exit_status: exit_code.max(0) as u32,
        })
    }

    async fn open_inbound_port(&self) -> Result<MappedPort> {
        let inspect = self
            .docker
            .inspect_container(&self.handle, None)
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;

        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(SSH_PORT_KEY).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port);

        host_port
            .and_then(|p| p.parse::<MappedPort>().ok())
            .ok_or_else(|| {
                Error::backend_rejected(format!("{}: no host port mapped for ssh", self.handle))
            })
    }

    async fn limit_memory(&self, bytes: u64) -> Result<()> {
        use bollard::container::UpdateContainerOptions;

        self.docker
            .update_container(
                &self.handle,
                UpdateContainerOptions::<String> {
                    memory: Some(bytes as i64),
                    memory_swap: Some(bytes as i64),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;

        tracing::debug!(handle = %self.handle, bytes, "memory limit applied");
        Ok(())
    }

    async fn limit_disk(&self, bytes: u64) -> Result<()> {
        let command = format!("mount -o remount,size={} {}", bytes, self.workdir);
        let exit_code = self.exec_collect(&command).await?;
        if exit_code != 0 {
            return Err(Error::backend_rejected(format!(
                "{}: workspace remount exited {exit_code}",
                self.handle
            )));
        }

        self.disk_limit_bytes.store(bytes, Ordering::SeqCst);
        self.disk_ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.handle.clone(), bytes);

        tracing::debug!(handle = %self.handle, bytes, "disk limit applied");
        Ok(())
    }

    async fn info(&self) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(&self.handle, None)
            .await
            .map_err(|e| map_docker_err(&self.handle, e))?;

        let memory_limit_bytes = inspect
            .host_config
            .and_then(|hc| hc.memory)
            .unwrap_or(0)
            .max(0) as u64;

        Ok(ContainerInfo {
            memory_limit_bytes,
            disk_limit_bytes: self.disk_limit_bytes.load(Ordering::SeqCst),
        })
    }
}

/// CLI arguments for an interactive shell inside a container, targeting
/// the daemon explicitly when a socket override is configured.
fn exec_args(socket: Option<&str>, handle: &str, shell: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(socket) = socket {
        args.push("-H".to_string());
        args.push(format!("unix://{socket}"));
    }
    args.extend([
        "exec".to_string(),
        "-it".to_string(),
        handle.to_string(),
        shell.to_string(),
    ]);
    args
}

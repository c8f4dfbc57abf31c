//! Shared data types for containers and tasks.

use serde::{Deserialize, Serialize};

/// Host-reachable port mapped into a container.
pub type MappedPort = u16;

/// Result of a one-shot command run inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobInfo {
    pub exit_status: u32,
}

/// Currently enforced limits of a container, as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub memory_limit_bytes: u64,
    pub disk_limit_bytes: u64,
}

/// Resources committed to one live container.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub handle: String,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// Host-side command whose pseudo-terminal provides an interactive shell
/// inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Exit state of a task's interactive process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExit {
    pub exit_code: u32,
}

impl TaskExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

//! Registry snapshots, written after every registry mutation so operators
//! can inspect what the agent is running.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use sandgate_core::types::MappedPort;

use crate::registry::Registry;

#[derive(Serialize)]
struct Snapshot {
    id: String,
    sessions: BTreeMap<String, SnapshotEntry>,
}

#[derive(Serialize)]
struct SnapshotEntry {
    container: String,
    port: MappedPort,
}

/// Writes the registry to a JSON file. With no path configured every
/// write is a no-op.
pub struct SnapshotWriter {
    path: Option<PathBuf>,
}

impl SnapshotWriter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub async fn write(&self, agent_id: Uuid, registry: &Registry) {
        let Some(path) = &self.path else { return };

        let sessions = registry
            .tasks()
            .into_iter()
            .map(|(id, task)| {
                (
                    id,
                    SnapshotEntry {
                        container: task.container_id().to_string(),
                        port: task.port(),
                    },
                )
            })
            .collect();
        let snapshot = Snapshot {
            id: agent_id.to_string(),
            sessions,
        };

        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot serialization failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(path, bytes).await {
            tracing::warn!(path = %path.display(), error = %e, "snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use sandgate_core::limits::TaskLimits;
    use sandgate_core::mocks::FakeContainer;
    use sandgate_core::types::ShellCommand;
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_registered_tasks_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let registry = Registry::new();
        let (reap_tx, _reap_rx) = tokio::sync::mpsc::channel(1);
        registry
            .register(Task::new(
                "t1".to_string(),
                "tok".to_string(),
                TaskLimits::new(1, 1),
                Arc::new(FakeContainer::new("container-1")),
                56789,
                ShellCommand {
                    program: "/bin/cat".to_string(),
                    args: Vec::new(),
                },
                reap_tx,
            ))
            .unwrap();

        let agent_id = Uuid::new_v4();
        let writer = SnapshotWriter::new(Some(path.clone()));
        writer.write(agent_id, &registry).await;

        let raw = tokio::fs::read(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed["id"], agent_id.to_string());
        assert_eq!(parsed["sessions"]["t1"]["container"], "container-1");
        assert_eq!(parsed["sessions"]["t1"]["port"], 56789);
    }

    #[tokio::test]
    async fn no_path_means_no_write() {
        let registry = Registry::new();
        let writer = SnapshotWriter::new(None);
        // Nothing to assert beyond not panicking and not touching the fs.
        writer.write(Uuid::new_v4(), &registry).await;
    }
}

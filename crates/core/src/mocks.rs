//! Mock implementations of the core traits for testing.
//!
//! These doubles record every call so tests can assert on backend
//! interactions: which limits were applied, how many containers were
//! provisioned, how often destroy was issued, and so on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::traits::{Container, ContainerBackend, MessageBus, RouterRegistrar};
use crate::types::{ContainerInfo, JobInfo, MappedPort, Reservation, ShellCommand};

// =============================================================================
// Fake Container
// =============================================================================

#[derive(Default)]
struct FakeContainerState {
    destroyed: bool,
    destroy_calls: usize,
    memory_limit_calls: Vec<u64>,
    disk_limit_calls: Vec<u64>,
    run_commands: Vec<String>,
}

/// In-memory container that records every call made against it.
pub struct FakeContainer {
    handle: String,
    port: MappedPort,
    fail_memory_limit: bool,
    state: Mutex<FakeContainerState>,
}

impl FakeContainer {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            port: 56789,
            fail_memory_limit: false,
            state: Mutex::new(FakeContainerState::default()),
        }
    }

    /// Make subsequent `limit_memory` calls fail with `BackendRejected`.
    pub fn failing_memory_limit(mut self) -> Self {
        self.fail_memory_limit = true;
        self
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    /// Number of destroy calls issued, including rejected duplicates.
    pub fn destroy_calls(&self) -> usize {
        self.state.lock().unwrap().destroy_calls
    }

    pub fn memory_limit_calls(&self) -> Vec<u64> {
        self.state.lock().unwrap().memory_limit_calls.clone()
    }

    pub fn disk_limit_calls(&self) -> Vec<u64> {
        self.state.lock().unwrap().disk_limit_calls.clone()
    }

    pub fn run_commands(&self) -> Vec<String> {
        self.state.lock().unwrap().run_commands.clone()
    }

    fn unknown_handle(&self) -> Error {
        Error::backend_rejected(format!("unknown handle: {}", self.handle))
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.handle
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.destroy_calls += 1;
        if state.destroyed {
            return Err(self.unknown_handle());
        }
        state.destroyed = true;
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<JobInfo> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(self.unknown_handle());
        }
        state.run_commands.push(command.to_string());
        Ok(JobInfo { exit_status: 0 })
    }

    async fn open_inbound_port(&self) -> Result<MappedPort> {
        if self.state.lock().unwrap().destroyed {
            return Err(self.unknown_handle());
        }
        Ok(self.port)
    }

    async fn limit_memory(&self, bytes: u64) -> Result<()> {
        if self.fail_memory_limit {
            return Err(Error::backend_rejected("memory limit refused"));
        }
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(self.unknown_handle());
        }
        state.memory_limit_calls.push(bytes);
        Ok(())
    }

    async fn limit_disk(&self, bytes: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(self.unknown_handle());
        }
        state.disk_limit_calls.push(bytes);
        Ok(())
    }

    async fn info(&self) -> Result<ContainerInfo> {
        let state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(self.unknown_handle());
        }
        Ok(ContainerInfo {
            memory_limit_bytes: state.memory_limit_calls.last().copied().unwrap_or(0),
            disk_limit_bytes: state.disk_limit_calls.last().copied().unwrap_or(0),
        })
    }
}

// =============================================================================
// Fake Backend
// =============================================================================

/// In-memory container backend handing out [`FakeContainer`]s.
pub struct FakeBackend {
    shell: ShellCommand,
    fail_provide: AtomicBool,
    fail_memory_limits: AtomicBool,
    next_handle: AtomicU16,
    provided: Mutex<Vec<Arc<FakeContainer>>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            shell: ShellCommand {
                program: "/bin/cat".to_string(),
                args: Vec::new(),
            },
            fail_provide: AtomicBool::new(false),
            fail_memory_limits: AtomicBool::new(false),
            next_handle: AtomicU16::new(0),
            provided: Mutex::new(Vec::new()),
        }
    }

    /// Use a specific host command for interactive attach in tests.
    pub fn with_shell(mut self, program: &str, args: &[&str]) -> Self {
        self.shell = ShellCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        self
    }

    /// Make `provide` fail with `BackendUnavailable`.
    pub fn set_provide_failure(&self, fail: bool) {
        self.fail_provide.store(fail, Ordering::SeqCst);
    }

    /// Make memory-limit calls on newly provided containers fail.
    pub fn set_memory_limit_failure(&self, fail: bool) {
        self.fail_memory_limits.store(fail, Ordering::SeqCst);
    }

    /// Every container handed out so far, in order.
    pub fn provided(&self) -> Vec<Arc<FakeContainer>> {
        self.provided.lock().unwrap().clone()
    }

    pub fn provide_count(&self) -> usize {
        self.provided.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn provide(&self) -> Result<Arc<dyn Container>> {
        if self.fail_provide.load(Ordering::SeqCst) {
            return Err(Error::backend_unavailable("fake backend offline"));
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let mut container = FakeContainer::new(format!("fake-{n}"));
        if self.fail_memory_limits.load(Ordering::SeqCst) {
            container = container.failing_memory_limit();
        }
        let container = Arc::new(container);
        self.provided.lock().unwrap().push(container.clone());
        Ok(container)
    }

    fn shell_command(&self, _container: &dyn Container) -> ShellCommand {
        self.shell.clone()
    }

    async fn reservations(&self) -> Result<Vec<Reservation>> {
        let provided = self.provided.lock().unwrap();
        Ok(provided
            .iter()
            .filter(|c| !c.is_destroyed())
            .map(|c| {
                let state = c.state.lock().unwrap();
                Reservation {
                    handle: c.handle.clone(),
                    memory_bytes: state.memory_limit_calls.last().copied().unwrap_or(0),
                    disk_bytes: state.disk_limit_calls.last().copied().unwrap_or(0),
                }
            })
            .collect())
    }
}

// =============================================================================
// In-Memory Message Bus
// =============================================================================

/// Process-local pub/sub bus for tests.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let senders: Vec<mpsc::Sender<Vec<u8>>> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.get(subject).cloned().unwrap_or_default()
        };
        for sender in senders {
            // Dropped receivers are fine; they just unsubscribed.
            let _ = sender.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// =============================================================================
// Recording Router Registrar
// =============================================================================

/// Registrar that records register/unregister calls.
#[derive(Default)]
pub struct RecordingRegistrar {
    registered: Mutex<Vec<(String, MappedPort)>>,
    unregistered: Mutex<Vec<String>>,
}

impl RecordingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<(String, MappedPort)> {
        self.registered.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouterRegistrar for RecordingRegistrar {
    async fn register(&self, task_id: &str, port: MappedPort) -> Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push((task_id.to_string(), port));
        Ok(())
    }

    async fn unregister(&self, task_id: &str) -> Result<()> {
        self.unregistered.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_container_records_limits() {
        let container = FakeContainer::new("c1");
        container.limit_memory(1024).await.unwrap();
        container.limit_disk(2048).await.unwrap();
        assert_eq!(container.memory_limit_calls(), vec![1024]);
        assert_eq!(container.disk_limit_calls(), vec![2048]);
        let info = container.info().await.unwrap();
        assert_eq!(info.memory_limit_bytes, 1024);
        assert_eq!(info.disk_limit_bytes, 2048);
    }

    #[tokio::test]
    async fn destroyed_container_rejects_further_use() {
        let container = FakeContainer::new("c1");
        container.destroy().await.unwrap();
        assert!(matches!(
            container.run("true").await,
            Err(Error::BackendRejected(_))
        ));
        assert!(matches!(
            container.destroy().await,
            Err(Error::BackendRejected(_))
        ));
        assert_eq!(container.destroy_calls(), 2);
    }

    #[tokio::test]
    async fn in_memory_bus_delivers_to_subscribers() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("test.subject").await.unwrap();
        bus.publish("test.subject", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }
}

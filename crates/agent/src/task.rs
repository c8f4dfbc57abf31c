//! A running task: one container plus an optionally running interactive
//! process on a pseudo-terminal.
//!
//! The process is spawned lazily on the first attach and shared by every
//! later attach. Process exit is authoritative: the waiter records the
//! exit status, destroys the container, and asks the agent to reap the
//! registry entry. Connection drops never touch the process.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use sandgate_core::error::{Error, Result};
use sandgate_core::limits::TaskLimits;
use sandgate_core::traits::Container;
use sandgate_core::types::{MappedPort, ShellCommand, TaskExit};

const OUTPUT_CAPACITY: usize = 1024;
const INPUT_CAPACITY: usize = 256;
const READ_CHUNK: usize = 4096;
const DEFAULT_PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

/// Exit status recorded when the process cannot be waited on.
const WAIT_FAILED_EXIT: u32 = 255;

struct TaskProcess {
    input: mpsc::Sender<Vec<u8>>,
    output: broadcast::Sender<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

/// Channels handed to one attached connection.
pub struct Attached {
    /// Bytes written here reach the process's terminal input.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Terminal output, shared by all attached connections.
    pub output: broadcast::Receiver<Vec<u8>>,
    /// Becomes `Some` exactly once, when the process exits.
    pub completion: watch::Receiver<Option<TaskExit>>,
}

pub struct Task {
    id: String,
    secure_token: String,
    limits: TaskLimits,
    container: Arc<dyn Container>,
    port: MappedPort,
    shell: ShellCommand,
    process: Mutex<Option<TaskProcess>>,
    completion_tx: watch::Sender<Option<TaskExit>>,
    destroyed: AtomicBool,
    reaper: mpsc::Sender<String>,
    // Handed to the process waiter so it can run the completion path.
    this: Weak<Task>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        secure_token: String,
        limits: TaskLimits,
        container: Arc<dyn Container>,
        port: MappedPort,
        shell: ShellCommand,
        reaper: mpsc::Sender<String>,
    ) -> Arc<Self> {
        let (completion_tx, _) = watch::channel(None);
        Arc::new_cyclic(|this| Self {
            id,
            secure_token,
            limits,
            container,
            port,
            shell,
            process: Mutex::new(None),
            completion_tx,
            destroyed: AtomicBool::new(false),
            reaper,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secure_token(&self) -> &str {
        &self.secure_token
    }

    pub fn limits(&self) -> TaskLimits {
        self.limits
    }

    pub fn container_id(&self) -> &str {
        self.container.id()
    }

    pub fn port(&self) -> MappedPort {
        self.port
    }

    pub fn is_completed(&self) -> bool {
        self.completion_tx.borrow().is_some()
    }

    pub fn completion(&self) -> watch::Receiver<Option<TaskExit>> {
        self.completion_tx.subscribe()
    }

    /// Attach to the task's interactive process, spawning it on the first
    /// call. Later attaches share the same process and output stream.
    pub async fn attach(&self) -> Result<Attached> {
        let mut guard = self.process.lock().await;
        if self.is_completed() {
            return Err(Error::internal(format!(
                "task {} process already exited",
                self.id
            )));
        }
        if guard.is_none() {
            *guard = Some(self.spawn_process()?);
            tracing::info!(task = %self.id, program = %self.shell.program, "task process spawned");
        }
        let process = guard
            .as_ref()
            .ok_or_else(|| Error::internal("task process missing after spawn"))?;
        Ok(Attached {
            input: process.input.clone(),
            output: process.output.subscribe(),
            completion: self.completion_tx.subscribe(),
        })
    }

    /// Resize the process's terminal. Fails if nothing is attached yet.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.process.lock().await;
        let process = guard
            .as_ref()
            .ok_or_else(|| Error::internal(format!("task {} has no process to resize", self.id)))?;
        process
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::internal(format!("pty resize: {e}")))
    }

    /// Operator-initiated stop: kill the process if it is still running,
    /// then destroy the container. The first error wins but the teardown
    /// still runs to the end.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_err = None;

        if !self.is_completed() {
            let guard = self.process.lock().await;
            if let Some(process) = guard.as_ref() {
                let mut killer = process.killer.lock().await;
                if let Err(e) = killer.kill() {
                    first_err = Some(Error::Io(e));
                }
            }
        }

        if let Err(e) = self.destroy_container().await {
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Destroy the backing container exactly once. Returns whether this
    /// call was the one that performed the destroy.
    async fn destroy_container(&self) -> Result<bool> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.container.destroy().await?;
        Ok(true)
    }

    /// Process-exit path: record the status, tear down the container, and
    /// ask the agent to drop the registry entry.
    async fn complete(&self, exit: TaskExit) {
        self.completion_tx.send_replace(Some(exit));
        tracing::info!(task = %self.id, exit_code = exit.exit_code, "task process exited");

        if let Err(e) = self.destroy_container().await {
            tracing::warn!(task = %self.id, error = %e, "container teardown after exit failed");
        }
        if self.reaper.send(self.id.clone()).await.is_err() {
            tracing::debug!(task = %self.id, "agent control loop gone, skipping reap");
        }
    }

    fn spawn_process(&self) -> Result<TaskProcess> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(DEFAULT_PTY_SIZE)
            .map_err(|e| Error::internal(format!("openpty: {e}")))?;

        let mut command = CommandBuilder::new(&self.shell.program);
        command.args(&self.shell.args);
        command.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| Error::internal(format!("spawn {}: {e}", self.shell.program)))?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::internal(format!("pty reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::internal(format!("pty writer: {e}")))?;

        let (output_tx, _) = broadcast::channel::<Vec<u8>>(OUTPUT_CAPACITY);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CAPACITY);

        // Output pump: PTY reads are blocking, so pump on a blocking thread.
        let output = output_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        // No receivers is fine; nobody is attached right now.
                        let _ = output.send(buf[..n].to_vec());
                    }
                }
            }
        });

        // Input pump: ends when every attach handle is dropped or the
        // process side closes the terminal.
        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = input_rx.blocking_recv() {
                if writer.write_all(&bytes).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Waiter: the single place that turns process exit into completion.
        let task = self
            .this
            .upgrade()
            .ok_or_else(|| Error::internal("task dropped before process spawn"))?;
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let exit = match status {
                Ok(Ok(status)) => TaskExit {
                    exit_code: status.exit_code(),
                },
                Ok(Err(e)) => {
                    tracing::warn!(task = %task.id, error = %e, "waiting on task process failed");
                    TaskExit {
                        exit_code: WAIT_FAILED_EXIT,
                    }
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "task process waiter panicked");
                    TaskExit {
                        exit_code: WAIT_FAILED_EXIT,
                    }
                }
            };
            task.complete(exit).await;
        });

        Ok(TaskProcess {
            input: input_tx,
            output: output_tx,
            master: pair.master,
            killer: Mutex::new(killer),
        })
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("container", &self.container.id())
            .field("port", &self.port)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandgate_core::mocks::FakeContainer;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_task(shell: ShellCommand) -> (Arc<Task>, Arc<FakeContainer>, mpsc::Receiver<String>) {
        let container = Arc::new(FakeContainer::new("c1"));
        let (reap_tx, reap_rx) = mpsc::channel(4);
        let task = Task::new(
            "t1".to_string(),
            "token".to_string(),
            TaskLimits::new(1, 1),
            container.clone(),
            56789,
            shell,
            reap_tx,
        );
        (task, container, reap_rx)
    }

    fn cat_shell() -> ShellCommand {
        ShellCommand {
            program: "/bin/cat".to_string(),
            args: Vec::new(),
        }
    }

    fn exiting_shell(code: u32) -> ShellCommand {
        ShellCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), format!("exit {code}")],
        }
    }

    async fn wait_for_exit(mut completion: watch::Receiver<Option<TaskExit>>) -> TaskExit {
        timeout(Duration::from_secs(5), completion.wait_for(Option::is_some))
            .await
            .expect("process did not exit in time")
            .expect("completion channel closed")
            .expect("completion must be set")
    }

    #[tokio::test]
    async fn attach_echoes_through_the_pty() {
        let (task, _container, _reap) = make_task(cat_shell());
        let first = task.attach().await.unwrap();
        let mut second = task.attach().await.unwrap();

        first.input.send(b"hello\n".to_vec()).await.unwrap();

        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("hello") {
            let chunk = timeout(Duration::from_secs(5), second.output.recv())
                .await
                .expect("no pty output")
                .expect("output stream closed");
            seen.extend_from_slice(&chunk);
        }

        task.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exit_status_reaches_every_attachment() {
        let (task, container, mut reap) = make_task(exiting_shell(7));
        let first = task.attach().await.unwrap();
        let second = task.attach().await.unwrap();

        assert_eq!(wait_for_exit(first.completion).await.exit_code, 7);
        assert_eq!(wait_for_exit(second.completion).await.exit_code, 7);

        // Exit destroys the container once and asks for a reap.
        assert_eq!(
            timeout(Duration::from_secs(5), reap.recv()).await.unwrap(),
            Some("t1".to_string())
        );
        assert!(container.is_destroyed());
        assert_eq!(container.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_kills_the_process_and_destroys_once() {
        let (task, container, mut reap) = make_task(cat_shell());
        let attached = task.attach().await.unwrap();

        task.shutdown().await.unwrap();

        wait_for_exit(attached.completion).await;
        let _ = timeout(Duration::from_secs(5), reap.recv()).await;
        assert!(container.is_destroyed());
        assert_eq!(container.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_after_exit_is_not_an_error() {
        let (task, container, _reap) = make_task(exiting_shell(0));
        let attached = task.attach().await.unwrap();
        wait_for_exit(attached.completion).await;

        task.shutdown().await.unwrap();
        assert_eq!(container.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_without_attach_destroys_the_container() {
        let (task, container, _reap) = make_task(cat_shell());
        task.shutdown().await.unwrap();
        assert!(container.is_destroyed());
    }

    #[tokio::test]
    async fn resize_before_attach_errors() {
        let (task, _container, _reap) = make_task(cat_shell());
        assert!(task.resize(80, 24).await.is_err());
    }

    #[test]
    fn debug_formatting_names_the_task() {
        let (task, _container, _reap) = make_task(cat_shell());
        let rendered = format!("{task:?}");
        assert!(rendered.contains("t1"));
        assert!(rendered.contains("c1"));
        assert!(!rendered.contains("token"), "secrets must not leak");
    }

    #[tokio::test]
    async fn attach_after_exit_is_refused() {
        let (task, _container, _reap) = make_task(exiting_shell(0));
        let attached = task.attach().await.unwrap();
        wait_for_exit(attached.completion).await;
        assert!(task.attach().await.is_err());
    }
}

//! TCP gateway bridging client connections onto task terminals.
//!
//! A connection opens with a line-based handshake:
//!
//! ```text
//! Task-Id: <task id>
//! Secure-Token: <token>
//! <blank line>
//! ```
//!
//! The gateway answers `Ok`, `Unknown Task`, or `Invalid Token` on its own
//! line, then (on success) switches to the framed protocol from
//! [`crate::protocol`]. Process exit closes the connection; a client
//! dropping the connection merely detaches and leaves the task running.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use sandgate_agent::registry::Registry;
use sandgate_agent::task::{Attached, Task};
use sandgate_core::error::{Error, Result};

use crate::protocol::{
    parse_pty_request, parse_window_change, Frame, RequestFrame, MAX_FRAME_LEN,
};

const FRAME_QUEUE: usize = 64;
/// Upper bound on a single handshake header line, newline included.
const MAX_HANDSHAKE_LINE: u64 = 4096;
/// Grace period for the pty reader to flush final output after exit.
const DRAIN_DELAY: Duration = Duration::from_millis(50);

pub struct ProxyServer {
    registry: Arc<Registry>,
}

impl ProxyServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn run(self: Arc<Self>, host: String, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        tracing::info!(%host, port, "gateway listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    tracing::debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let handshake = read_handshake(&mut reader).await?;

        let Some(task) = self.registry.lookup(&handshake.task_id) else {
            write_half.write_all(b"Unknown Task\n").await?;
            return Ok(());
        };
        if task.secure_token() != handshake.secure_token {
            tracing::warn!(task = %handshake.task_id, "attach refused, bad token");
            write_half.write_all(b"Invalid Token\n").await?;
            return Ok(());
        }

        let attached = task.attach().await?;
        write_half.write_all(b"Ok\n").await?;
        tracing::info!(task = %task.id(), "client attached");

        bridge(reader, write_half, task, attached).await
    }
}

struct Handshake {
    task_id: String,
    secure_token: String,
}

async fn read_handshake<R>(reader: &mut R) -> Result<Handshake>
where
    R: AsyncBufRead + Unpin,
{
    let mut task_id = None;
    let mut secure_token = None;
    loop {
        let mut line = String::new();
        let n = (&mut *reader)
            .take(MAX_HANDSHAKE_LINE)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(Error::protocol_decode("connection closed during handshake"));
        }
        if !line.ends_with('\n') && n as u64 >= MAX_HANDSHAKE_LINE {
            return Err(Error::protocol_decode("handshake line too long"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::protocol_decode(format!(
                "malformed handshake line: {line}"
            )));
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "task-id" => task_id = Some(value.trim().to_string()),
            "secure-token" => secure_token = Some(value.trim().to_string()),
            // Unknown headers are tolerated.
            _ => {}
        }
    }
    Ok(Handshake {
        task_id: task_id.ok_or_else(|| Error::protocol_decode("handshake missing Task-Id"))?,
        secure_token: secure_token.unwrap_or_default(),
    })
}

/// Pump frames between the connection and the attached task until the
/// client detaches or the process exits. Exit drains remaining output to
/// the client before the connection closes; detach leaves the task alone.
async fn bridge<R, W>(mut reader: R, writer: W, task: Arc<Task>, attached: Attached) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let Attached {
        input,
        mut output,
        completion,
    } = attached;

    let (frames_tx, frames_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
    let writer_task = tokio::spawn(write_frames(writer, frames_rx));

    let downstream_tx = frames_tx.clone();
    let mut downstream_completion = completion.clone();
    let downstream = tokio::spawn(async move {
        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Ok(bytes) => {
                        if downstream_tx.send(Frame::Data(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "slow client dropped terminal output");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                // The watch guard stays inside the inner future; holding
                // it across the drain would make this task !Send.
                exited = async { downstream_completion.wait_for(Option::is_some).await.is_ok() } => {
                    if !exited {
                        break;
                    }
                    // The pty reader may still be flushing the last bytes.
                    tokio::time::sleep(DRAIN_DELAY).await;
                    while let Ok(bytes) = output.try_recv() {
                        if downstream_tx.send(Frame::Data(bytes)).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    });

    let mut main_completion = completion;
    let mut process_exited = false;
    loop {
        tokio::select! {
            exited = async { main_completion.wait_for(Option::is_some).await.is_ok() } => {
                if exited {
                    tracing::info!(task = %task.id(), "process exited, closing connection");
                }
                process_exited = true;
                break;
            }
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(Frame::Data(bytes))) => {
                    if input.send(bytes).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Request(request))) => {
                    let ok = handle_request(&task, &request).await;
                    if request.want_reply && frames_tx.send(Frame::Ack(ok)).await.is_err() {
                        break;
                    }
                }
                // Clients have no business sending acks; ignore them.
                Ok(Some(Frame::Ack(_))) => {}
                Ok(None) => {
                    tracing::info!(task = %task.id(), "client detached, task keeps running");
                    break;
                }
                Err(e) => {
                    tracing::debug!(task = %task.id(), error = %e, "frame read failed");
                    break;
                }
            }
        }
    }

    if process_exited {
        // Let the drain finish so the client sees the final output.
        let _ = downstream.await;
    } else {
        downstream.abort();
    }
    drop(frames_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn handle_request(task: &Task, request: &RequestFrame) -> bool {
    match request.name.as_str() {
        "pty-req" => match parse_pty_request(&request.payload) {
            Some(geometry) => resize(task, geometry.cols, geometry.rows).await,
            None => false,
        },
        "window-change" => match parse_window_change(&request.payload) {
            Some(geometry) => resize(task, geometry.cols, geometry.rows).await,
            None => false,
        },
        // The terminal is already wired up by attach.
        "shell" | "env" => true,
        other => {
            tracing::debug!(task = %task.id(), request = other, "unsupported request");
            false
        }
    }
}

async fn resize(task: &Task, cols: u32, rows: u32) -> bool {
    let cols = cols.min(u16::MAX as u32) as u16;
    let rows = rows.min(u16::MAX as u32) as u16;
    task.resize(cols, rows).await.is_ok()
}

async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut kind = [0u8; 1];
    match reader.read_exact(&mut kind).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol_decode(format!(
            "frame length {len} exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Frame::decode(kind[0], payload).map(Some)
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if writer.write_all(&frame.encode()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_pty_request, encode_window_change};
    use sandgate_core::limits::TaskLimits;
    use sandgate_core::mocks::FakeContainer;
    use sandgate_core::types::ShellCommand;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn make_registry(shell: ShellCommand) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        let (reap_tx, _reap_rx) = mpsc::channel(4);
        registry
            .register(Task::new(
                "t1".to_string(),
                "secret".to_string(),
                TaskLimits::new(1, 1),
                Arc::new(FakeContainer::new("c1")),
                56789,
                shell,
                reap_tx,
            ))
            .unwrap();
        registry
    }

    fn cat_shell() -> ShellCommand {
        ShellCommand {
            program: "/bin/cat".to_string(),
            args: Vec::new(),
        }
    }

    fn spawn_server(
        registry: Arc<Registry>,
    ) -> (
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) {
        let server = Arc::new(ProxyServer::new(registry));
        let (client, server_side) = duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = server.serve_connection(server_side).await;
        });
        let (read_half, write_half) = tokio::io::split(client);
        (write_half, BufReader::new(read_half))
    }

    async fn handshake(
        writer: &mut (impl AsyncWrite + Unpin),
        reader: &mut (impl AsyncBufReadExt + Unpin),
        task_id: &str,
        token: &str,
    ) -> String {
        writer
            .write_all(format!("Task-Id: {task_id}\r\nSecure-Token: {token}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut line = String::new();
        timeout(TIMEOUT, reader.read_line(&mut line))
            .await
            .expect("no handshake reply")
            .unwrap();
        line
    }

    async fn next_data(reader: &mut (impl AsyncRead + Unpin)) -> Frame {
        timeout(TIMEOUT, read_frame(reader))
            .await
            .expect("no frame")
            .unwrap()
            .expect("stream closed")
    }

    #[tokio::test]
    async fn unknown_task_is_refused() {
        let registry = Arc::new(Registry::new());
        let (mut writer, mut reader) = spawn_server(registry);
        let reply = handshake(&mut writer, &mut reader, "nope", "x").await;
        assert_eq!(reply, "Unknown Task\n");
    }

    #[tokio::test]
    async fn bad_token_is_refused() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry);
        let reply = handshake(&mut writer, &mut reader, "t1", "wrong").await;
        assert_eq!(reply, "Invalid Token\n");
    }

    #[tokio::test]
    async fn data_frames_flow_both_ways() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry.clone());
        let reply = handshake(&mut writer, &mut reader, "t1", "secret").await;
        assert_eq!(reply, "Ok\n");

        writer
            .write_all(&Frame::Data(b"ping\n".to_vec()).encode())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("ping") {
            match next_data(&mut reader).await {
                Frame::Data(bytes) => seen.extend_from_slice(&bytes),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        registry.lookup("t1").unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn window_change_is_acked() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry.clone());
        handshake(&mut writer, &mut reader, "t1", "secret").await;

        let request = Frame::Request(RequestFrame {
            name: "window-change".to_string(),
            want_reply: true,
            payload: encode_window_change(120, 40),
        });
        writer.write_all(&request.encode()).await.unwrap();
        assert_eq!(next_data(&mut reader).await, Frame::Ack(true));

        registry.lookup("t1").unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn zero_geometry_is_nacked() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry.clone());
        handshake(&mut writer, &mut reader, "t1", "secret").await;

        let request = Frame::Request(RequestFrame {
            name: "pty-req".to_string(),
            want_reply: true,
            payload: encode_pty_request("xterm", 0, 24),
        });
        writer.write_all(&request.encode()).await.unwrap();
        assert_eq!(next_data(&mut reader).await, Frame::Ack(false));

        registry.lookup("t1").unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn detach_leaves_the_task_running() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry.clone());
        handshake(&mut writer, &mut reader, "t1", "secret").await;

        // Hang up abruptly.
        drop(writer);
        drop(reader);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = registry.lookup("t1").expect("task must survive detach");
        assert!(!task.is_completed());

        // A second client can pick the session back up.
        let (mut writer, mut reader) = spawn_server(registry.clone());
        let reply = handshake(&mut writer, &mut reader, "t1", "secret").await;
        assert_eq!(reply, "Ok\n");

        task.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_closes_the_connection() {
        let registry = make_registry(ShellCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo done; exit 0".to_string()],
        });
        let (mut writer, mut reader) = spawn_server(registry.clone());
        let reply = handshake(&mut writer, &mut reader, "t1", "secret").await;
        assert_eq!(reply, "Ok\n");

        // Read until the server closes the stream; the final output must
        // have been drained to us first.
        let mut seen = Vec::new();
        loop {
            match timeout(TIMEOUT, read_frame(&mut reader))
                .await
                .expect("connection did not close")
                .unwrap()
            {
                Some(Frame::Data(bytes)) => seen.extend_from_slice(&bytes),
                Some(_) => {}
                None => break,
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("done"));
    }

    #[tokio::test]
    async fn unbounded_handshake_line_is_refused() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry.clone());

        // A header that never terminates must not buffer forever.
        let endless = vec![b'a'; 2 * MAX_HANDSHAKE_LINE as usize];
        writer.write_all(&endless).await.unwrap();

        let mut reply = String::new();
        let n = timeout(TIMEOUT, reader.read_line(&mut reply))
            .await
            .expect("server did not hang up")
            .unwrap();
        assert_eq!(n, 0, "connection should close with no reply");

        // The registered task is untouched.
        let task = registry.lookup("t1").unwrap();
        assert!(!task.is_completed());
    }

    #[tokio::test]
    async fn oversized_frame_drops_the_connection() {
        let registry = make_registry(cat_shell());
        let (mut writer, mut reader) = spawn_server(registry.clone());
        handshake(&mut writer, &mut reader, "t1", "secret").await;

        let mut bad = vec![crate::protocol::FRAME_DATA];
        bad.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        writer.write_all(&bad).await.unwrap();

        // The server closes without crashing; the task itself survives.
        loop {
            match timeout(TIMEOUT, read_frame(&mut reader))
                .await
                .expect("connection did not close")
                .unwrap()
            {
                Some(_) => {}
                None => break,
            }
        }
        let task = registry.lookup("t1").unwrap();
        assert!(!task.is_completed());
        task.shutdown().await.unwrap();
    }
}

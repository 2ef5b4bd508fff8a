//! Command channel: client requests and the exec proxy that serves them.

use crate::error::{DStoreError, Result};
use crate::protocol::codec::{ExecRequest, Reply, Request};
use crate::protocol::mux::{LogicalChannel, Multiplexer, COMMAND_CHANNEL};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, instrument, warn};

const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Client end of the command channel.
///
/// One request is in flight at a time; the lock spans the request and its
/// reply so callers never interleave on the physical channel.
#[derive(Clone)]
pub struct CommandChannel {
    mux: Multiplexer,
    channel: Arc<TokioMutex<LogicalChannel>>,
}

impl CommandChannel {
    pub fn open(mux: Multiplexer) -> Result<Self> {
        let channel = mux.open(COMMAND_CHANNEL)?;
        Ok(Self {
            mux,
            channel: Arc::new(TokioMutex::new(channel)),
        })
    }

    /// Sends `request` and waits for its reply.
    pub async fn send(&self, request: &Request) -> Result<()> {
        let payload = request.encode()?;
        let mut channel = self.channel.lock().await;
        channel.send(&payload).await?;
        expect_reply(&mut channel).await?.into_result()
    }

    /// Launches a process on the remote side. Side channels for stdout,
    /// stderr and stdin are allocated before the request goes out so no
    /// output can be missed.
    #[instrument(skip(self, env), fields(command = ?command))]
    pub async fn exec(
        &self,
        command: Vec<String>,
        env: BTreeMap<String, String>,
        directory: &str,
        redirect: bool,
        append_env: bool,
    ) -> Result<RemoteProcess> {
        let stdout = self.mux.allocate()?;
        let stderr = self.mux.allocate()?;
        let stdin = self.mux.allocate()?;
        let request = ExecRequest {
            command,
            env,
            directory: directory.to_string(),
            redirect,
            append_env,
            chan_a: stdout.id(),
            chan_b: stderr.id(),
            chan_c: stdin.id(),
        };
        self.send(&Request::Exec(request)).await?;
        Ok(RemoteProcess { stdout, stderr, stdin })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(&Request::Shutdown).await
    }
}

async fn expect_reply(channel: &mut LogicalChannel) -> Result<Reply> {
    let raw = channel
        .recv()
        .await
        .ok_or_else(|| DStoreError::Transport("command channel closed while waiting for reply".to_string()))?;
    Reply::decode(raw)
}

/// Streams of a process started through [`CommandChannel::exec`].
#[derive(Debug)]
pub struct RemoteProcess {
    pub stdout: LogicalChannel,
    pub stderr: LogicalChannel,
    pub stdin: LogicalChannel,
}

impl RemoteProcess {
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.stdin.send(data).await
    }

    pub async fn close_stdin(&self) -> Result<()> {
        self.stdin.close().await
    }

    /// Reads stdout until the remote side closes it.
    pub async fn read_stdout_to_end(&mut self) -> Vec<u8> {
        read_to_end(&mut self.stdout).await
    }

    pub async fn read_stderr_to_end(&mut self) -> Vec<u8> {
        read_to_end(&mut self.stderr).await
    }
}

async fn read_to_end(channel: &mut LogicalChannel) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = channel.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

/// Serves exec requests arriving on the command channel until the peer
/// asks for shutdown or the connection drops.
#[instrument(skip(mux, base_env))]
pub async fn serve_exec_requests(mux: Multiplexer, base_env: BTreeMap<String, String>) -> Result<()> {
    let mut channel = mux.open(COMMAND_CHANNEL)?;
    while let Some(raw) = channel.recv().await {
        let reply = match Request::decode(raw) {
            Ok(Request::Exec(request)) => match spawn_exec(&mux, request, &base_env) {
                Ok(()) => Reply::Ok,
                Err(DStoreError::RemoteExecution(message)) => {
                    warn!(error = %message, "Exec request failed");
                    Reply::Error(message)
                }
                Err(e) => {
                    warn!(error = %e, "Exec request failed");
                    Reply::Error(e.to_string())
                }
            },
            Ok(Request::Shutdown) => {
                channel.send(&Reply::Ok.encode()?).await?;
                info!("Command channel shut down by peer");
                return Ok(());
            }
            Err(e) => {
                // Framing is unrecoverable once the two sides disagree.
                let _ = channel.send(&Reply::Error(e.to_string()).encode()?).await;
                return Err(e);
            }
        };
        channel.send(&reply.encode()?).await?;
    }
    debug!("Command channel closed");
    Ok(())
}

fn spawn_exec(mux: &Multiplexer, request: ExecRequest, base_env: &BTreeMap<String, String>) -> Result<()> {
    let (program, args) = request
        .command
        .split_first()
        .ok_or_else(|| DStoreError::InvalidArgument("empty command".to_string()))?;

    let mut cmd = TokioCommand::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !request.directory.is_empty() {
        cmd.current_dir(&request.directory);
    }
    if !request.append_env {
        cmd.env_clear();
        cmd.envs(base_env);
    }
    cmd.envs(&request.env);

    let mut child = cmd
        .spawn()
        .map_err(|e| DStoreError::RemoteExecution(format!("failed to start '{}': {}", program, e)))?;
    info!(pid = ?child.id(), program = %program, "Spawned process for command channel");

    let stdin_channel = mux.open(request.chan_c)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let output_mux = mux.clone();
    tokio::spawn(async move {
        let err_target = if request.redirect { request.chan_a } else { request.chan_b };
        tokio::join!(
            pump(stdout, &output_mux, request.chan_a),
            pump(stderr, &output_mux, err_target),
        );
        let _ = output_mux.close_channel(request.chan_a).await;
        let _ = output_mux.close_channel(request.chan_b).await;
    });
    if let Some(mut stdin) = child.stdin.take() {
        let mut stdin_channel = stdin_channel;
        tokio::spawn(async move {
            while let Some(data) = stdin_channel.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });
    }
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(code = ?status.code(), "Command channel process exited"),
            Err(e) => warn!(error = %e, "Failed to wait for command channel process"),
        }
    });
    Ok(())
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, mux: &Multiplexer, channel: u8) {
    let Some(mut reader) = reader else { return };
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if mux.send_to(channel, &buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(channel, error = %e, "Process stream read failed");
                break;
            }
        }
    }
}

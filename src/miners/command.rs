use crate::dispatcher::{Invocation, Miner};
use crate::error::{DStoreError, Result};
use crate::protocol::constants::{
    CommandName, ARGUMENT_TYPE, COMMAND_MINER, DIRECTORY_TYPE, ENVIRONMENT_TYPE, EXIT_CODE_TYPE, FLAG_TYPE,
    STDERR_TYPE, STDOUT_TYPE,
};
use crate::store::Element;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, instrument, warn};

pub const REDIRECT_FLAG: &str = "redirect";
pub const APPEND_ENV_FLAG: &str = "appendEnv";

/// What `C_EXEC` should launch, read from its argument elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub directory: Option<String>,
    pub redirect: bool,
    pub append_env: bool,
}

impl ExecSpec {
    /// `argument` elements are command words in order, `environment`
    /// elements hold `KEY=VALUE`, a `directory` element sets the working
    /// directory and `flag` elements named `redirect`/`appendEnv` toggle the
    /// matching options.
    pub fn from_args(args: &[Element]) -> Result<Self> {
        let mut spec = ExecSpec::default();
        for arg in args {
            let value = arg.value();
            match arg.kind().as_str() {
                ARGUMENT_TYPE => spec.command.push(value),
                ENVIRONMENT_TYPE => {
                    let (key, val) = value.split_once('=').ok_or_else(|| {
                        DStoreError::InvalidArgument(format!("environment entry without '=': {}", value))
                    })?;
                    spec.env.insert(key.to_string(), val.to_string());
                }
                DIRECTORY_TYPE => spec.directory = Some(value).filter(|d| !d.is_empty()),
                FLAG_TYPE => {
                    let on = arg.typed_value().as_bool().unwrap_or(false);
                    match arg.name().as_str() {
                        REDIRECT_FLAG => spec.redirect = on,
                        APPEND_ENV_FLAG => spec.append_env = on,
                        other => debug!(flag = %other, "Ignoring unknown exec flag"),
                    }
                }
                other => debug!(kind = %other, "Ignoring exec argument"),
            }
        }
        if spec.command.is_empty() {
            return Err(DStoreError::InvalidArgument("C_EXEC needs at least one command word".to_string()));
        }
        Ok(spec)
    }
}

/// Runs processes for `C_EXEC` and streams their output into the store.
pub struct CommandMiner {
    default_directory: PathBuf,
}

impl CommandMiner {
    pub fn new(default_directory: PathBuf) -> Self {
        Self { default_directory }
    }

    fn build(&self, spec: &ExecSpec) -> Result<TokioCommand> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| DStoreError::InvalidArgument("empty command".to_string()))?;
        let mut cmd = TokioCommand::new(program);
        cmd.args(args);
        if !spec.append_env {
            cmd.env_clear();
            // PATH survives so bare program names still resolve.
            if !spec.env.contains_key("PATH") {
                if let Some(path) = std::env::var_os("PATH") {
                    cmd.env("PATH", path);
                }
            }
        }
        cmd.envs(&spec.env);
        match &spec.directory {
            Some(dir) => cmd.current_dir(dir),
            None => cmd.current_dir(&self.default_directory),
        };
        cmd.stdin(StdProcessStdio::null());
        cmd.stdout(StdProcessStdio::piped());
        cmd.stderr(StdProcessStdio::piped());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

impl Miner for CommandMiner {
    fn id(&self) -> &'static str {
        COMMAND_MINER
    }

    fn commands(&self) -> &'static [CommandName] {
        &[CommandName::Exec]
    }

    fn handle(&self, invocation: Invocation) {
        let prepared = ExecSpec::from_args(invocation.args()).and_then(|spec| Ok((self.build(&spec)?, spec)));
        match prepared {
            Ok((cmd, spec)) => {
                tokio::spawn(run_process(invocation, cmd, spec));
            }
            Err(e) => invocation.finish(Err(e)),
        }
    }
}

#[instrument(skip(invocation, cmd, spec), fields(command = ?spec.command, status = %invocation.status().id()))]
async fn run_process(invocation: Invocation, mut cmd: TokioCommand, spec: ExecSpec) {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to spawn command");
            let err = DStoreError::RemoteExecution(format!("Failed to spawn command '{}': {}", spec.command.join(" "), e));
            return invocation.finish(Err(err));
        }
    };
    let pid = child.id();
    info!(pid = ?pid, "Command started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let err_kind = if spec.redirect { STDOUT_TYPE } else { STDERR_TYPE };
    let collect = async {
        tokio::join!(
            forward_lines(stdout, &invocation, STDOUT_TYPE),
            forward_lines(stderr, &invocation, err_kind),
        )
    };

    let exit = tokio::select! {
        _ = invocation.cancelled() => None,
        (_, _, status) = async { let (a, b) = collect.await; (a, b, child.wait().await) } => Some(status),
    };

    match exit {
        None => {
            info!(pid = ?pid, "Command cancelled, killing process");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Kill failed, process probably exited");
            }
            let _ = child.wait().await;
            let _ = invocation.mark_cancelled();
        }
        Some(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            info!(pid = ?pid, exit_code = code, "Command finished");
            let result = invocation
                .add_result(EXIT_CODE_TYPE, "exit code", code as i64)
                .map(|_| ());
            invocation.finish(result);
        }
        Some(Err(e)) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for command");
            invocation.finish(Err(DStoreError::Io(e)));
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: Option<R>, invocation: &Invocation, kind: &str) {
    let Some(stream) = stream else { return };
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if let Err(e) = invocation.add_result(kind, kind, line) {
            debug!(error = %e, "Dropping output line");
            return;
        }
    }
}

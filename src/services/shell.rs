use crate::error::{DStoreError, Result};
use crate::miners::command::{APPEND_ENV_FLAG, REDIRECT_FLAG};
use crate::miners::host_environment;
use crate::monitor::WaitOutcome;
use crate::protocol::constants::{
    CommandName, ARGUMENT_TYPE, DIRECTORY_TYPE, ENVIRONMENT_MINER, ENVIRONMENT_TYPE, EXIT_CODE_TYPE, FLAG_TYPE,
    STDERR_TYPE, STDOUT_TYPE,
};
use crate::protocol::RemoteProcess;
use crate::services::connection::{check_remote_errors, ClientConnection};
use crate::services::{CommandOutput, ShellCapability};
use crate::store::Element;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub struct DStoreShellService {
    conn: Arc<ClientConnection>,
}

impl DStoreShellService {
    pub fn new(conn: Arc<ClientConnection>) -> Self {
        Self { conn }
    }

    /// Argument elements understood by `C_EXEC`.
    fn exec_args(&self, command: &[String], directory: &str, env: &BTreeMap<String, String>) -> Result<Vec<Element>> {
        let store = self.conn.store();
        let temp = store.temp_root();
        let mut args = Vec::with_capacity(command.len() + env.len() + 3);
        for word in command {
            args.push(store.create(temp, ARGUMENT_TYPE, "arg", word.as_str())?);
        }
        for (key, value) in env {
            args.push(store.create(temp, ENVIRONMENT_TYPE, key, format!("{}={}", key, value))?);
        }
        if !directory.is_empty() {
            args.push(store.create(temp, DIRECTORY_TYPE, "directory", directory)?);
        }
        args.push(store.create(temp, FLAG_TYPE, REDIRECT_FLAG, false)?);
        args.push(store.create(temp, FLAG_TYPE, APPEND_ENV_FLAG, env.is_empty())?);
        Ok(args)
    }
}

fn collect_output(status: &Element) -> CommandOutput {
    let mut output = CommandOutput::default();
    for child in status.children() {
        match child.kind().as_str() {
            STDOUT_TYPE => output.stdout.push(child.value()),
            STDERR_TYPE => output.stderr.push(child.value()),
            EXIT_CODE_TYPE => output.exit_code = child.typed_value().as_i64(),
            _ => {}
        }
    }
    output
}

#[async_trait]
impl ShellCapability for DStoreShellService {
    async fn host_environment(&self) -> Result<Vec<String>> {
        let miner = self.conn.ensure_miner(ENVIRONMENT_MINER).await?;
        Ok(host_environment(&miner))
    }

    /// An empty `env` runs with the server's own environment; otherwise the
    /// process sees only `env` plus `PATH`.
    #[instrument(skip(self, env, cancel))]
    async fn run_command(
        &self,
        command: &[String],
        directory: &str,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if command.is_empty() {
            return Err(DStoreError::InvalidArgument("no command given".to_string()));
        }
        let args = self.exec_args(command, directory, env)?;
        let host = self.conn.store().host_root().clone();
        let status = self.conn.command(CommandName::Exec.as_str(), &host, &args)?;
        match self.conn.wait(&status, cancel).await? {
            WaitOutcome::Done => {
                check_remote_errors(CommandName::Exec.as_str(), &status)?;
                Ok(collect_output(&status))
            }
            WaitOutcome::Cancelled => Err(DStoreError::Cancelled(format!("{} was cancelled", command.join(" ")))),
        }
    }

    async fn launch(&self, command: Vec<String>, directory: &str, redirect: bool) -> Result<RemoteProcess> {
        self.conn
            .exec(command, BTreeMap::new(), directory, redirect, true)
            .await
    }
}

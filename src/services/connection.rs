//! Client end of a DataStore connection.
//!
//! The client keeps a replica of the server's store. Deltas from the server
//! are applied in arrival order, so result elements are always in place
//! before the status that covers them turns terminal.

use crate::config::Config;
use crate::context::DStoreContext;
use crate::error::{DStoreError, Result};
use crate::monitor::{RemoteCancel, StatusMonitor, WaitOptions, WaitOutcome};
use crate::miners::filesystem::split_path;
use crate::protocol::constants::{
    CommandName, ARGUMENT_TYPE, COMMAND_TYPE, ERROR_TYPE, STATUS_TYPE, UNIVERSAL_FILE_DESCRIPTOR,
    UNIVERSAL_FOLDER_DESCRIPTOR,
};
use crate::protocol::mux::DATASTORE_CHANNEL;
use crate::protocol::{
    classify, CommandChannel, CommandRequest, Envelope, HandshakeResult, LogicalChannel, Multiplexer,
    RemoteProcess, DATASTORE_VERSION,
};
use crate::protocol::handshake::ServerVersion;
use crate::server;
use crate::store::{Attribute, DataStore, Delta, Element, ElementId, ElementValue, StatusState};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const LOCAL_PIPE_CAPACITY: usize = 256 * 1024;

/// Creates command elements in the replica and ships them to the server.
#[derive(Clone)]
struct Outbound {
    store: Arc<DataStore>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbound {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| DStoreError::Transport("connection writer has stopped".to_string()))
    }

    fn command(&self, name: &str, subject: &Element, args: &[Element]) -> Result<Element> {
        self.command_then(name, subject, args, |_| {})
    }

    /// `prepare` sees the status before the server can answer for it.
    fn command_then(
        &self,
        name: &str,
        subject: &Element,
        args: &[Element],
        prepare: impl FnOnce(&Element),
    ) -> Result<Element> {
        let command = self
            .store
            .create(self.store.log_root(), COMMAND_TYPE, name, subject.id().as_str())?;
        let status = self.store.create_status(&command)?;
        prepare(&status);
        let request = CommandRequest {
            command: command.snapshot(),
            status: status.snapshot(),
            subject: subject.snapshot(),
            args: args.iter().map(Element::snapshot).collect(),
        };
        self.send(Envelope::Command(request))?;
        debug!(command = %name, status = %status.id(), "Command sent");
        Ok(status)
    }
}

impl RemoteCancel for Outbound {
    fn request_cancel(&self, status: &Element) {
        if let Err(e) = self.command(CommandName::Cancel.as_str(), status, &[]) {
            debug!(status = %status.id(), error = %e, "Could not send cancel");
        }
    }
}

/// Local files the server may write into, keyed by the download's status.
#[derive(Default)]
pub struct PendingDownloads {
    targets: Mutex<HashMap<ElementId, PathBuf>>,
}

impl PendingDownloads {
    pub fn expect(&self, status: &ElementId, local: &Path) {
        self.lock().insert(status.clone(), local.to_path_buf());
    }

    pub fn forget(&self, status: &ElementId) {
        self.lock().remove(status);
    }

    pub fn accepts(&self, status: &ElementId, destination: &str) -> bool {
        self.lock()
            .get(status)
            .is_some_and(|local| local.as_path() == Path::new(destination))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ElementId, PathBuf>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ClientConnection {
    host: String,
    ctx: Arc<DStoreContext>,
    store: Arc<DataStore>,
    mux: Multiplexer,
    commands: CommandChannel,
    outbound: Outbound,
    handshake: HandshakeResult,
    server_version: Option<ServerVersion>,
    downloads: Arc<PendingDownloads>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_server: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ClientConnection {
    /// Runs a server session in this process and connects to it through an
    /// in-memory pipe.
    pub async fn local(config: Arc<Config>) -> Result<Arc<Self>> {
        let (client_io, server_io) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
        let session = tokio::spawn(server::serve_connection(server_io, config.clone()));
        let connection = Self::establish(client_io, config, "localhost".to_string()).await?;
        *connection.local_server.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(connection)
    }

    #[instrument(skip(config))]
    pub async fn connect(host: &str, port: u16, config: Arc<Config>) -> Result<Arc<Self>> {
        let stream = TcpStream::connect((host, port)).await.map_err(DStoreError::transport)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        Self::establish(stream, config, host.to_string()).await
    }

    async fn establish<S>(stream: S, config: Arc<Config>, host: String) -> Result<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ctx = DStoreContext::new(config);
        let store = DataStore::new(ctx.clone(), format!("cli-{}", ctx.connection_id()));
        let mux = Multiplexer::new(stream);
        let mut channel = mux.open(DATASTORE_CHANNEL)?;

        let (handshake, server_version) = read_handshake(&mut channel).await;
        if !handshake.is_compatible() {
            warn!(host = %host, result = ?handshake, "Refusing server");
            return Err(DStoreError::Protocol(handshake.message().to_string()));
        }
        info!(host = %host, result = %handshake, version = ?server_version, "Handshake complete");

        let commands = CommandChannel::open(mux.clone())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound { store: store.clone(), tx };
        let writer = tokio::spawn(write_envelopes(mux.clone(), rx));
        let downloads = Arc::new(PendingDownloads::default());
        let reader = tokio::spawn(apply_deltas(channel, store.clone(), downloads.clone()));

        Ok(Arc::new(Self {
            host,
            ctx,
            store,
            mux,
            commands,
            outbound,
            handshake,
            server_version,
            downloads,
            tasks: Mutex::new(vec![writer, reader]),
            local_server: Mutex::new(None),
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<DStoreContext> {
        &self.ctx
    }

    pub fn handshake(&self) -> HandshakeResult {
        self.handshake
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.server_version
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected() && !self.mux.is_closed()
    }

    /// The miner element synced from the server, by miner id.
    pub fn find_miner(&self, id: &str) -> Option<Element> {
        self.store.find(self.store.miner_root(), Attribute::Name, id, 1)
    }

    /// A scratch element naming a remote file or folder, usable as a
    /// command subject or argument.
    pub fn remote_object(&self, path: &str, folder: bool) -> Result<Element> {
        let kind = if folder {
            UNIVERSAL_FOLDER_DESCRIPTOR
        } else {
            UNIVERSAL_FILE_DESCRIPTOR
        };
        let (name, parent) = split_path(Path::new(path));
        self.store.create(self.store.temp_root(), kind, &name, parent)
    }

    pub fn argument(&self, value: impl Into<ElementValue>) -> Result<Element> {
        self.store.create(self.store.temp_root(), ARGUMENT_TYPE, "arg", value)
    }

    /// Sends `name` against `subject` and returns the status to wait on.
    pub fn command(&self, name: &str, subject: &Element, args: &[Element]) -> Result<Element> {
        self.outbound.command(name, subject, args)
    }

    /// Asks the server to activate a miner; the returned status turns done
    /// once it is up.
    /// Sends a `C_DOWNLOAD_FILE` command whose chunks may only land in
    /// `local`. The caller forgets the download once it settles.
    pub fn download_command(&self, subject: &Element, args: &[Element], local: &Path) -> Result<Element> {
        self.outbound
            .command_then(CommandName::DownloadFile.as_str(), subject, args, |status| {
                self.downloads.expect(status.id(), local)
            })
    }

    pub fn downloads(&self) -> &PendingDownloads {
        &self.downloads
    }

    pub fn activate_miner(&self, miner: &str) -> Result<Element> {
        let start = StatusState::Pending.as_str();
        let status = self.store.create(self.store.log_root(), STATUS_TYPE, start, start)?;
        self.outbound.send(Envelope::ActivateMiner {
            miner: miner.to_string(),
            status: status.snapshot(),
        })?;
        Ok(status)
    }

    /// A monitor whose cancellations are forwarded to the server.
    pub fn monitor(&self) -> StatusMonitor {
        StatusMonitor::new(self.store.clone()).with_canceller(Arc::new(self.outbound.clone()))
    }

    pub async fn wait(&self, status: &Element, cancel: &CancellationToken) -> Result<WaitOutcome> {
        self.monitor()
            .wait_for_update(status, cancel, &WaitOptions::default())
            .await
    }

    /// Runs a command to completion. Errors recorded by the server under the
    /// status come back as [`DStoreError::RemoteExecution`].
    pub async fn run(&self, name: &str, subject: &Element, args: &[Element]) -> Result<Element> {
        self.run_with(name, subject, args, &CancellationToken::new()).await
    }

    pub async fn run_with(
        &self,
        name: &str,
        subject: &Element,
        args: &[Element],
        cancel: &CancellationToken,
    ) -> Result<Element> {
        let status = self.command(name, subject, args)?;
        match self.wait(&status, cancel).await? {
            WaitOutcome::Done => {
                check_remote_errors(name, &status)?;
                Ok(status)
            }
            WaitOutcome::Cancelled => Err(DStoreError::Cancelled(format!("{} was cancelled", name))),
        }
    }

    /// Activates `miner` and waits until the server reports it ready.
    pub async fn ensure_miner(&self, miner: &str) -> Result<Element> {
        let status = self.activate_miner(miner)?;
        self.wait(&status, &CancellationToken::new()).await?;
        check_remote_errors(miner, &status)?;
        self.find_miner(miner)
            .ok_or_else(|| DStoreError::StaleElement(format!("miner {} is not known to the server", miner)))
    }

    /// Launches a process through the command channel proxy.
    pub async fn exec(
        &self,
        command: Vec<String>,
        env: BTreeMap<String, String>,
        directory: &str,
        redirect: bool,
        append_env: bool,
    ) -> Result<RemoteProcess> {
        self.commands.exec(command, env, directory, redirect, append_env).await
    }

    /// Says goodbye to the server and stops every background task. Waits on
    /// this connection fail from here on.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn disconnect(&self) {
        if !self.mux.is_closed() {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.commands.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Command channel shutdown failed"),
                Err(_) => debug!("Command channel shutdown timed out"),
            }
        }
        if let Err(e) = self.outbound.send(Envelope::Exit) {
            debug!(error = %e, "Exit not sent");
        }
        let session = self.local_server.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, session).await {
                Ok(Ok(Err(e))) => warn!(error = %e, "Local server session failed"),
                Ok(_) => {}
                Err(_) => warn!("Local server session did not stop in time"),
            }
        }
        self.ctx.teardown();
        self.store.set_connected(false);
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        info!("Disconnected");
    }
}

async fn read_handshake(channel: &mut LogicalChannel) -> (HandshakeResult, Option<ServerVersion>) {
    let raw = match tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.recv()).await {
        Err(_) => return (HandshakeResult::Timeout, None),
        Ok(None) => return (HandshakeResult::Unexpected, None),
        Ok(Some(raw)) => raw,
    };
    match Envelope::from_bytes(&raw) {
        Ok(Envelope::Handshake { version }) => classify(DATASTORE_VERSION, &version),
        Ok(_) => (HandshakeResult::Unexpected, None),
        Err(_) => {
            // Not JSON; an old server sends its version as a bare string.
            let text = String::from_utf8_lossy(&raw);
            classify(DATASTORE_VERSION, text.trim())
        }
    }
}

async fn write_envelopes(mux: Multiplexer, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let sent = match envelope.to_bytes() {
            Ok(raw) => mux.send_to(DATASTORE_CHANNEL, &raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(error = %e, "Envelope writer stopped");
            return;
        }
    }
}

async fn apply_deltas(mut channel: LogicalChannel, store: Arc<DataStore>, downloads: Arc<PendingDownloads>) {
    while let Some(raw) = channel.recv().await {
        match Envelope::from_bytes(&raw) {
            Ok(Envelope::Delta(Delta::Transfer {
                status,
                destination,
                offset,
                data,
            })) => {
                if !downloads.accepts(&status, &destination) {
                    warn!(status = %status, file = %destination, "Dropping chunk for a file no download asked for");
                    continue;
                }
                if let Err(e) = write_chunk(Path::new(&destination), offset, &data).await {
                    warn!(status = %status, file = %destination, error = %e, "Could not write download chunk");
                }
            }
            Ok(Envelope::Delta(delta)) => {
                if let Err(e) = store.apply(delta) {
                    debug!(error = %e, "Delta not applied");
                }
            }
            Ok(Envelope::Exit) => break,
            Ok(other) => debug!(envelope = ?other, "Ignoring server envelope"),
            Err(e) => warn!(error = %e, "Malformed envelope from server"),
        }
    }
    debug!("Server stream ended");
    store.set_connected(false);
}

/// Offset 0 starts the file over; anything else extends it.
async fn write_chunk(destination: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = if offset == 0 {
        tokio::fs::File::create(destination).await?
    } else {
        tokio::fs::OpenOptions::new().append(true).open(destination).await?
    };
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Turns an error element under `status` into an error.
pub fn check_remote_errors(what: &str, status: &Element) -> Result<()> {
    match status.children_of_type(ERROR_TYPE).into_iter().next() {
        Some(error) => Err(DStoreError::RemoteExecution(format!(
            "{} failed with {}: {}",
            what,
            error.name(),
            error.value()
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::ENVIRONMENT_MINER;

    #[tokio::test]
    async fn local_connection_syncs_and_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let conn = ClientConnection::local(Arc::new(Config::for_root(dir.path()))).await.unwrap();
        assert_eq!(conn.handshake(), HandshakeResult::Correct);
        assert_eq!(conn.server_version().unwrap().version, 8);

        let miner = conn.ensure_miner(ENVIRONMENT_MINER).await.unwrap();
        assert!(!miner.children().is_empty());

        conn.disconnect().await;
        assert!(!conn.is_connected());
        let status = conn.store().create(conn.store().log_root(), STATUS_TYPE, "start", "start");
        assert!(status.is_err());
    }

    #[tokio::test]
    async fn old_servers_are_refused() {
        let (client, server) = tokio::io::duplex(4096);
        let server_mux = Multiplexer::new(server);
        server_mux
            .send_to(DATASTORE_CHANNEL, b"<DataElement type=\"handshake\"/>")
            .await
            .unwrap();
        let err = ClientConnection::establish(client, Arc::new(Config::for_root("/tmp")), "old".to_string())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("older DataStore server"));
    }

    #[tokio::test]
    async fn chunks_rebuild_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.bin");
        std::fs::write(&target, b"stale content").unwrap();
        write_chunk(&target, 0, b"abc").await.unwrap();
        write_chunk(&target, 3, b"def").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
    }

    #[test]
    fn only_the_registered_destination_is_accepted() {
        let downloads = PendingDownloads::default();
        let status = ElementId::from("cli.7");
        assert!(!downloads.accepts(&status, "/tmp/out.bin"));
        downloads.expect(&status, Path::new("/tmp/out.bin"));
        assert!(downloads.accepts(&status, "/tmp/out.bin"));
        assert!(!downloads.accepts(&status, "/etc/passwd"));
        assert!(!downloads.accepts(&ElementId::from("cli.8"), "/tmp/out.bin"));
        downloads.forget(&status);
        assert!(!downloads.accepts(&status, "/tmp/out.bin"));
    }

    #[tokio::test]
    async fn chunks_for_unknown_destinations_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("wanted.bin");
        let planted = dir.path().join("planted.bin");
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_mux = Multiplexer::new(server);
        let handshake = Envelope::Handshake {
            version: DATASTORE_VERSION.to_string(),
        };
        server_mux
            .send_to(DATASTORE_CHANNEL, &handshake.to_bytes().unwrap())
            .await
            .unwrap();
        let conn = ClientConnection::establish(client, Arc::new(Config::for_root("/tmp")), "fake".to_string())
            .await
            .unwrap();
        let status = ElementId::from("cli.42");
        conn.downloads().expect(&status, &wanted);

        let chunk = |status: &ElementId, destination: &Path| {
            Envelope::Delta(Delta::Transfer {
                status: status.clone(),
                destination: destination.display().to_string(),
                offset: 0,
                data: b"payload".to_vec(),
            })
            .to_bytes()
            .unwrap()
        };
        for raw in [
            chunk(&status, &planted),
            chunk(&ElementId::from("cli.43"), &wanted),
            chunk(&status, &wanted),
            Envelope::Exit.to_bytes().unwrap(),
        ] {
            server_mux.send_to(DATASTORE_CHANNEL, &raw).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!planted.exists());
        assert_eq!(std::fs::read(&wanted).unwrap(), b"payload");
    }

    #[test]
    fn remote_errors_surface() {
        let store = DataStore::new(DStoreContext::new(Arc::new(Config::for_root("/tmp"))), "cli");
        let status = store.create(store.log_root(), STATUS_TYPE, "done", "done").unwrap();
        assert!(check_remote_errors("C_QUERY_ROOTS", &status).is_ok());
        store.create(&status, ERROR_TYPE, "IOException", "denied").unwrap();
        let err = check_remote_errors("C_QUERY_ROOTS", &status).unwrap_err();
        assert!(matches!(err, DStoreError::RemoteExecution(_)));
        assert!(err.to_string().contains("denied"));
    }
}

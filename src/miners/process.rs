//! Process tracking through a long-lived `sh` running `ps`.

use crate::config::Config;
use crate::dispatcher::scheduler::Handler;
use crate::dispatcher::{Invocation, Miner};
use crate::error::{DStoreError, Result};
use crate::protocol::constants::{CommandName, PROCESS_MINER, PROCESS_TYPE, PROPERTY_TYPE};
use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use std::hash::{Hash, Hasher};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, instrument, warn};

const LISTING_TOOL: &str = "ps";
const END_MARKER: &str = "__DSTORE_PS_END__";
const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// A (pid, command) pair. Two descriptors are equal when their pids are.
#[derive(Debug, Clone, Eq)]
pub struct ProcessDescriptor {
    pub pid: String,
    pub command: String,
}

impl ProcessDescriptor {
    pub fn new(pid: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            pid: pid.into(),
            command: command.into(),
        }
    }

    /// Whether the basename of the command is `name`.
    pub fn has_command(&self, name: &str) -> bool {
        self.command.rsplit('/').next() == Some(name)
    }
}

impl PartialEq for ProcessDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

impl Hash for ProcessDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pid.hash(state);
    }
}

/// `ps` format flags for the OS, or `None` where tracking is unsupported.
pub fn format_options(os: &str) -> Option<&'static str> {
    let os = os.to_lowercase();
    if os.starts_with('z') {
        Some("-o pid,comm")
    } else if os.starts_with("linux") {
        Some("--format pid,ucomm")
    } else if os.starts_with("aix") {
        Some("-F pid,ucomm")
    } else {
        None
    }
}

/// Parses `ps` output: the header line is skipped and the listing tool's
/// own entries are dropped.
pub fn parse_listing<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<ProcessDescriptor> {
    lines
        .into_iter()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(' ')?;
            Some(ProcessDescriptor::new(pid, command.trim()))
        })
        .filter(|d| !d.has_command(LISTING_TOOL))
        .collect()
}

/// Tracked processes and the most recently appeared one.
#[derive(Debug, Default, Clone)]
pub struct ProcessTable {
    current: Vec<ProcessDescriptor>,
    newest: Option<ProcessDescriptor>,
}

impl ProcessTable {
    /// Diffs `listing` against the tracked set by pid. The first population
    /// never marks anything as newest.
    pub fn update(&mut self, mut listing: Vec<ProcessDescriptor>) {
        let first_run = self.current.is_empty();
        self.current.retain(|p| {
            if let Some(pos) = listing.iter().position(|n| n == p) {
                listing.remove(pos);
                true
            } else {
                false
            }
        });
        if let Some(newest) = &self.newest {
            if !self.current.contains(newest) {
                self.newest = None;
            }
        }
        for descriptor in listing {
            if !first_run {
                self.newest = Some(descriptor.clone());
            }
            self.current.push(descriptor);
        }
    }

    pub fn processes(&self) -> &[ProcessDescriptor] {
        &self.current
    }

    pub fn newest(&self) -> Option<&ProcessDescriptor> {
        self.newest.as_ref()
    }

    /// The newest process if it runs `command`, else the latest tracked one
    /// that does.
    pub fn find_last(&self, command: &str) -> Option<&ProcessDescriptor> {
        if let Some(newest) = self.newest.as_ref().filter(|n| n.has_command(command)) {
            return Some(newest);
        }
        self.current.iter().rev().find(|d| d.has_command(command))
    }

    pub fn find_pid(&self, pid: &str) -> Option<&ProcessDescriptor> {
        self.current.iter().find(|d| d.pid == pid)
    }
}

struct TrackerShell {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct TrackerInner {
    ps_command: Option<String>,
    shell_program: String,
    encoding: &'static Encoding,
    shell: TokioMutex<Option<TrackerShell>>,
    table: StdMutex<ProcessTable>,
    update_flag: AtomicBool,
}

/// Handle to the tracker; clones share one sub-shell and table.
#[derive(Clone)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

impl ProcessTracker {
    pub fn new(config: &Config) -> Self {
        Self::for_os(config, std::env::consts::OS)
    }

    pub fn for_os(config: &Config, os: &str) -> Self {
        let ps_command = format_options(os).map(|fmt| format!("{} -u \"$(id -un)\" {}", LISTING_TOOL, fmt));
        if ps_command.is_none() {
            info!(os = %os, "Process tracking is not supported on this OS");
        }
        let encoding = match &config.stdin_encoding {
            Some(label) => Encoding::for_label(label.as_bytes()).unwrap_or_else(|| {
                warn!(encoding = %label, "Unknown tracker encoding, falling back to UTF-8");
                UTF_8
            }),
            None => UTF_8,
        };
        Self {
            inner: Arc::new(TrackerInner {
                ps_command,
                shell_program: config.default_shell.clone(),
                encoding,
                shell: TokioMutex::new(None),
                table: StdMutex::new(ProcessTable::default()),
                update_flag: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.ps_command.is_some()
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.inner.encoding
    }

    pub fn table(&self) -> ProcessTable {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Asks the next scheduler tick to refresh the table.
    pub fn request_update(&self) {
        self.inner.update_flag.store(self.is_enabled(), Ordering::SeqCst);
    }

    fn ensure_enabled(&self) -> Result<&str> {
        self.inner.ps_command.as_deref().ok_or_else(|| {
            DStoreError::RemoteExecution(format!("process tracking is not supported on {}", std::env::consts::OS))
        })
    }

    fn spawn_shell(&self) -> Result<TrackerShell> {
        let mut child = TokioCommand::new(&self.inner.shell_program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DStoreError::RemoteExecution(format!("failed to start tracker shell: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DStoreError::RemoteExecution("tracker shell has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DStoreError::RemoteExecution("tracker shell has no stdout".to_string()))?;
        debug!(pid = ?child.id(), "Started tracker shell");
        Ok(TrackerShell {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn write_line(&self, shell: &mut TrackerShell, line: &str) -> Result<()> {
        let (encoded, _, _) = self.inner.encoding.encode(line);
        shell.stdin.write_all(&encoded).await?;
        shell.stdin.write_all(b"\n").await?;
        shell.stdin.flush().await?;
        Ok(())
    }

    /// Runs `ps` in the sub-shell and diffs the result into the table.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<ProcessTable> {
        let ps_command = self.ensure_enabled()?.to_string();
        let mut guard = self.inner.shell.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn_shell()?);
        }
        let Some(shell) = guard.as_mut() else {
            return Err(DStoreError::RemoteExecution("tracker shell unavailable".to_string()));
        };

        let request = format!("{}; echo {}", ps_command, END_MARKER);
        if let Err(e) = self.write_line(shell, &request).await {
            // The shell died; start a fresh one next time.
            *guard = None;
            return Err(e);
        }

        let mut lines = Vec::new();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = shell.stdout.read_until(b'\n', &mut raw).await?;
            if read == 0 {
                *guard = None;
                return Err(DStoreError::RemoteExecution("tracker shell exited".to_string()));
            }
            let (decoded, _) = self.inner.encoding.decode_without_bom_handling(&raw);
            let line = decoded.trim_end_matches(['\r', '\n']).to_string();
            if line == END_MARKER {
                break;
            }
            lines.push(line);
        }
        drop(guard);

        let listing = parse_listing(lines.iter().map(String::as_str));
        let mut table = self.inner.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.update(listing);
        debug!(tracked = table.processes().len(), newest = ?table.newest().map(|n| &n.pid), "Process table refreshed");
        Ok(table.clone())
    }

    /// Sends `kill <pid>` through the sub-shell.
    pub async fn kill(&self, descriptor: &ProcessDescriptor) -> Result<()> {
        self.ensure_enabled()?;
        if descriptor.pid.is_empty() || !descriptor.pid.chars().all(|c| c.is_ascii_digit()) {
            return Err(DStoreError::InvalidArgument(format!("not a pid: {}", descriptor.pid)));
        }
        let mut guard = self.inner.shell.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn_shell()?);
        }
        if let Some(shell) = guard.as_mut() {
            self.write_line(shell, &format!("kill {}", descriptor.pid)).await?;
        }
        info!(pid = %descriptor.pid, command = %descriptor.command, "Sent kill");
        drop(guard);
        self.request_update();
        Ok(())
    }

    /// Kills the most recent process running `command`.
    pub async fn kill_command(&self, command: &str) -> Result<Option<ProcessDescriptor>> {
        let target = self.table().find_last(command).cloned();
        if let Some(descriptor) = &target {
            self.kill(descriptor).await?;
        }
        Ok(target)
    }

    pub async fn kill_latest(&self) -> Result<Option<ProcessDescriptor>> {
        let target = self.table().newest().cloned();
        if let Some(descriptor) = &target {
            self.kill(descriptor).await?;
        }
        Ok(target)
    }

    /// Tells the sub-shell to exit and waits for it.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.shell.lock().await;
        if let Some(mut shell) = guard.take() {
            let _ = self.write_line(&mut shell, "exit").await;
            let _ = shell.child.wait().await;
            debug!("Tracker shell stopped");
        }
    }
}

#[async_trait]
impl Handler for ProcessTracker {
    fn name(&self) -> &str {
        "process-tracker"
    }

    fn interval(&self) -> Option<Duration> {
        self.is_enabled().then_some(UPDATE_INTERVAL)
    }

    async fn tick(&self) {
        if self.inner.update_flag.swap(false, Ordering::SeqCst) {
            let tracker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tracker.refresh().await {
                    debug!(error = %e, "Scheduled process refresh failed");
                }
            });
        }
    }
}

/// `C_QUERY_PROCESSES` and `C_KILL`.
pub struct ProcessMiner {
    tracker: ProcessTracker,
}

impl ProcessMiner {
    pub fn new(tracker: ProcessTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }
}

impl Miner for ProcessMiner {
    fn id(&self) -> &'static str {
        PROCESS_MINER
    }

    fn commands(&self) -> &'static [CommandName] {
        &[CommandName::QueryProcesses, CommandName::Kill]
    }

    fn handle(&self, invocation: Invocation) {
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            let result = match invocation.command() {
                CommandName::QueryProcesses => query_processes(&tracker, &invocation).await,
                CommandName::Kill => kill(&tracker, &invocation).await,
                other => Err(DStoreError::UnknownCommand(other.to_string())),
            };
            invocation.finish(result);
        });
    }
}

async fn query_processes(tracker: &ProcessTracker, invocation: &Invocation) -> Result<()> {
    let table = tracker.refresh().await?;
    for descriptor in table.processes() {
        invocation.add_result(PROCESS_TYPE, &descriptor.command, descriptor.pid.as_str())?;
    }
    if let Some(newest) = table.newest() {
        invocation.add_result(PROPERTY_TYPE, "newest", newest.pid.as_str())?;
    }
    Ok(())
}

/// The argument is a pid, `*` for the newest process, or a command name.
async fn kill(tracker: &ProcessTracker, invocation: &Invocation) -> Result<()> {
    let target = invocation.arg_value(0).unwrap_or_default();
    let target = target.trim();
    let killed = if target == "*" {
        tracker.kill_latest().await?
    } else if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
        let descriptor = tracker
            .table()
            .find_pid(target)
            .cloned()
            .unwrap_or_else(|| ProcessDescriptor::new(target, ""));
        tracker.kill(&descriptor).await?;
        Some(descriptor)
    } else {
        tracker.kill_command(target).await?
    };
    match killed {
        Some(descriptor) => {
            invocation.add_result(PROCESS_TYPE, &descriptor.command, descriptor.pid.as_str())?;
            Ok(())
        }
        None => Err(DStoreError::InvalidArgument(format!("no tracked process matches '{}'", target))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(pid: &str, cmd: &str) -> ProcessDescriptor {
        ProcessDescriptor::new(pid, cmd)
    }

    #[test]
    fn diff_replaces_vanished_and_marks_newest() {
        let mut table = ProcessTable::default();
        table.update(vec![d("9", "init")]);
        table.update(vec![d("1", "a"), d("2", "b")]);
        table.update(vec![d("2", "b"), d("3", "c")]);

        let pids: Vec<&str> = table.processes().iter().map(|p| p.pid.as_str()).collect();
        assert_eq!(pids, vec!["2", "3"]);
        assert_eq!(table.processes()[0].command, "b");
        assert_eq!(table.newest(), Some(&d("3", "c")));
        assert_eq!(table.newest().unwrap().command, "c");
    }

    #[test]
    fn first_population_has_no_newest() {
        let mut table = ProcessTable::default();
        table.update(vec![d("1", "a"), d("2", "b")]);
        assert!(table.newest().is_none());
        assert_eq!(table.processes().len(), 2);
    }

    #[test]
    fn listing_skips_header_and_the_tool_itself() {
        let output = "    PID COMMAND\n  101 bash\n  102 /bin/ps\n  103 /usr/bin/vim\n";
        let parsed = parse_listing(output.lines());
        assert_eq!(parsed, vec![d("101", "bash"), d("103", "/usr/bin/vim")]);
        assert!(parsed[1].has_command("vim"));
        assert!(!parsed[1].has_command("usr"));
    }

    #[test]
    fn find_last_prefers_newest() {
        let mut table = ProcessTable::default();
        table.update(vec![d("1", "init")]);
        table.update(vec![d("1", "init"), d("5", "vim"), d("6", "vim"), d("7", "make")]);
        assert_eq!(table.newest().unwrap().pid, "7");
        assert_eq!(table.find_last("vim").unwrap().pid, "6");
        assert_eq!(table.find_last("make").unwrap().pid, "7");
        assert!(table.find_last("emacs").is_none());
    }

    #[test]
    fn format_flags_follow_the_os() {
        assert_eq!(format_options("Linux"), Some("--format pid,ucomm"));
        assert_eq!(format_options("aix"), Some("-F pid,ucomm"));
        assert_eq!(format_options("z/OS"), Some("-o pid,comm"));
        assert_eq!(format_options("windows"), None);
    }

    #[tokio::test]
    async fn unsupported_os_disables_tracking() {
        let tracker = ProcessTracker::for_os(&Config::for_root("/tmp"), "windows");
        assert!(!tracker.is_enabled());
        assert!(matches!(tracker.refresh().await, Err(DStoreError::RemoteExecution(_))));
        assert!(tracker.interval().is_none());
    }

    #[tokio::test]
    async fn unknown_encoding_falls_back_to_utf8() {
        let mut config = Config::for_root("/tmp");
        config.stdin_encoding = Some("no-such-charset".to_string());
        let tracker = ProcessTracker::for_os(&config, "linux");
        assert_eq!(tracker.encoding(), UTF_8);
        config.stdin_encoding = Some("ISO-8859-1".to_string());
        let tracker = ProcessTracker::for_os(&config, "linux");
        assert_eq!(tracker.encoding().name(), "windows-1252");
    }

    #[tokio::test]
    async fn live_refresh_sees_a_spawned_sleep() {
        if std::env::consts::OS != "linux" || which::which("ps").is_err() {
            return;
        }
        let tracker = ProcessTracker::new(&Config::for_root("/tmp"));
        tracker.refresh().await.unwrap();
        let mut sleeper = TokioCommand::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        let pid = sleeper.id().unwrap().to_string();

        let table = tracker.refresh().await.unwrap();
        assert!(table.find_pid(&pid).is_some());
        assert!(table.processes().iter().all(|p| !p.has_command("ps")));

        tracker.kill(&ProcessDescriptor::new(pid, "sleep")).await.unwrap();
        let exited = tokio::time::timeout(Duration::from_secs(5), sleeper.wait()).await;
        assert!(exited.is_ok());
        tracker.shutdown().await;
    }
}

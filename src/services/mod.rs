//! Typed client services over a [`ClientConnection`].
//!
//! Each capability is a trait so callers can depend on the operation set
//! rather than on the DataStore backend behind it.

pub mod connection;
pub mod files;
pub mod processes;
pub mod shell;

pub use connection::ClientConnection;
pub use files::DStoreFileService;
pub use processes::DStoreProcessService;
pub use shell::DStoreShellService;

use crate::error::Result;
use crate::miners::{FileProperties, ProcessDescriptor};
use crate::monitor::{ProgressMonitor, WaitOutcome};
use crate::protocol::RemoteProcess;
use crate::store::Element;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A file or folder on the remote host.
#[derive(Debug, Clone)]
pub struct HostFile {
    pub name: String,
    pub parent: String,
    pub properties: FileProperties,
    element: Element,
}

impl HostFile {
    pub fn from_element(element: Element) -> Self {
        Self {
            name: element.name(),
            parent: element.value(),
            properties: FileProperties::from_source(&element.source()).unwrap_or_default(),
            element,
        }
    }

    pub fn path(&self) -> String {
        crate::miners::element_path(&self.element)
    }

    pub fn is_dir(&self) -> bool {
        self.properties.is_dir
    }

    pub fn element(&self) -> &Element {
        &self.element
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    All,
    Files,
    Folders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Text,
    Binary,
}

/// Result of one item of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub path: String,
    /// `None` when the item succeeded.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Path of the matching file.
    pub path: String,
    /// Matching line and its number for content searches.
    pub line: Option<(u64, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: Option<i64>,
}

#[async_trait]
pub trait FileCapability: Send + Sync {
    async fn roots(&self) -> Result<Vec<HostFile>>;
    async fn list(&self, folder: &str, filter: Option<&str>, kind: ListKind) -> Result<Vec<HostFile>>;
    async fn get_file(&self, path: &str) -> Result<HostFile>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn create_file(&self, path: &str) -> Result<HostFile>;
    async fn create_folder(&self, path: &str) -> Result<HostFile>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn delete_batch(&self, paths: &[String]) -> Result<Vec<BatchItem>>;
    async fn rename(&self, path: &str, new_name: &str) -> Result<HostFile>;
    async fn copy(&self, source: &str, target_folder: &str, new_name: Option<&str>) -> Result<HostFile>;
    async fn copy_batch(&self, sources: &[String], target_folder: &str) -> Result<Vec<BatchItem>>;
    async fn search(&self, folder: &str, name_pattern: &str, content: Option<&str>) -> Result<Vec<SearchHit>>;
    async fn set_readonly(&self, path: &str, readonly: bool) -> Result<()>;
    async fn set_last_modified(&self, path: &str, millis: i64) -> Result<()>;
    async fn properties(&self, path: &str) -> Result<BTreeMap<String, String>>;
    async fn classification(&self, path: &str) -> Result<String>;
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        mode: TransferMode,
        encoding: Option<&str>,
        progress: Option<Arc<dyn ProgressMonitor>>,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome>;
    async fn os_type(&self) -> Result<String>;
    async fn system_encoding(&self) -> Result<String>;
    async fn unused_port(&self) -> Result<u16>;
}

#[async_trait]
pub trait ShellCapability: Send + Sync {
    /// `KEY=VALUE` entries of the remote host environment.
    async fn host_environment(&self) -> Result<Vec<String>>;

    /// Runs `command` through the command miner and collects its output.
    async fn run_command(
        &self,
        command: &[String],
        directory: &str,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput>;

    /// Starts an interactive process with streams on side channels.
    async fn launch(&self, command: Vec<String>, directory: &str, redirect: bool) -> Result<RemoteProcess>;
}

#[async_trait]
pub trait ProcessCapability: Send + Sync {
    async fn list_processes(&self) -> Result<Vec<ProcessDescriptor>>;

    /// Kills by pid, by command name (newest match) or `*` for the newest
    /// process started since the tracker began.
    async fn kill(&self, target: &str) -> Result<ProcessDescriptor>;
}

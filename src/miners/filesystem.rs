//! The universal file system miner.
//!
//! File and folder elements carry the file name as their name, the parent
//! folder as their value and the basic properties in their source attribute.

use crate::dispatcher::{error_kind, Invocation, Miner};
use crate::error::{DStoreError, Result};
use crate::protocol::constants::*;
use crate::store::{Attribute, DataStore, Element};
use crate::utils::line_ending_handler::{LineEndingCounter, LineEndingNormalizer, LineEndingStyle};
use crate::utils::path_utils::{creatable_path, existing_path, join_remote, normalize_path};
use encoding_rs::{CoderResult, Decoder, Encoder, Encoding, UTF_8};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, instrument, warn};

/// Basic properties as stored in a file element's source attribute:
/// `exists|isDirectory|size|modifiedMillis|readOnly|hidden`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileProperties {
    pub exists: bool,
    pub is_dir: bool,
    pub size: u64,
    pub modified_ms: i64,
    pub readonly: bool,
    pub hidden: bool,
}

impl FileProperties {
    pub async fn of(path: &Path) -> Self {
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false);
        match fs::metadata(path).await {
            Ok(metadata) => Self {
                exists: true,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified_ms: metadata.modified().map(millis_since_epoch).unwrap_or(0),
                readonly: metadata.permissions().readonly(),
                hidden,
            },
            Err(_) => Self {
                hidden,
                ..Self::default()
            },
        }
    }

    pub fn to_source(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.exists, self.is_dir, self.size, self.modified_ms, self.readonly, self.hidden
        )
    }

    pub fn from_source(source: &str) -> Option<Self> {
        let parts: Vec<&str> = source.split('|').collect();
        if parts.len() != 6 {
            return None;
        }
        Some(Self {
            exists: parts[0].parse().ok()?,
            is_dir: parts[1].parse().ok()?,
            size: parts[2].parse().ok()?,
            modified_ms: parts[3].parse().ok()?,
            readonly: parts[4].parse().ok()?,
            hidden: parts[5].parse().ok()?,
        })
    }
}

fn millis_since_epoch(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The remote path an element stands for.
pub fn element_path(element: &Element) -> String {
    match element.kind().as_str() {
        UNIVERSAL_FILE_DESCRIPTOR | UNIVERSAL_FOLDER_DESCRIPTOR => join_remote(&element.value(), &element.name()),
        _ => {
            let value = element.value();
            if value.is_empty() {
                element.name()
            } else {
                value
            }
        }
    }
}

/// Name and parent folder of `path`, the way file elements store them.
pub fn split_path(path: &Path) -> (String, String) {
    match path.file_name() {
        Some(name) => (
            name.to_string_lossy().into_owned(),
            path.parent().map(|p| p.display().to_string()).unwrap_or_default(),
        ),
        None => (path.display().to_string(), String::new()),
    }
}

/// Compiles a `*`/`?` wildcard into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| DStoreError::InvalidArgument(format!("bad pattern '{}': {}", pattern, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    All,
    Files,
    Folders,
}

impl View {
    fn admits(self, is_dir: bool) -> bool {
        match self {
            View::All => true,
            View::Files => !is_dir,
            View::Folders => is_dir,
        }
    }
}

struct FsInner {
    files_root: PathBuf,
    system_encoding: String,
}

/// Handles every file command of the catalog plus `C_START_SPIRIT`.
pub struct FileSystemMiner {
    inner: Arc<FsInner>,
}

impl FileSystemMiner {
    pub fn new(files_root: PathBuf, system_encoding: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FsInner {
                files_root,
                system_encoding: system_encoding.into(),
            }),
        }
    }
}

impl Miner for FileSystemMiner {
    fn id(&self) -> &'static str {
        UNIVERSAL_FILESYSTEM_MINER
    }

    fn commands(&self) -> &'static [CommandName] {
        use CommandName::*;
        &[
            QueryRoots,
            QueryViewAll,
            QueryViewFiles,
            QueryViewFolders,
            CreateFile,
            CreateFolder,
            QueryGetRemoteObject,
            Delete,
            DeleteBatch,
            Rename,
            Copy,
            CopyBatch,
            Search,
            SetReadOnly,
            SetLastModified,
            QueryBasicProperty,
            QueryCanWriteProperty,
            QueryAdvanceProperty,
            QueryFileClassification,
            QueryExists,
            GetOsType,
            DownloadFile,
            SystemEncoding,
            QueryUnusedPort,
            StartSpirit,
        ]
    }

    fn handle(&self, invocation: Invocation) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.run(&invocation).await;
            invocation.finish(result);
        });
    }
}

impl FsInner {
    #[instrument(skip(self, inv), fields(command = %inv.command(), subject = %inv.subject().id()))]
    async fn run(&self, inv: &Invocation) -> Result<()> {
        use CommandName::*;
        match inv.command() {
            QueryRoots => self.query_roots(inv).await,
            QueryViewAll => self.query_view(inv, View::All).await,
            QueryViewFiles => self.query_view(inv, View::Files).await,
            QueryViewFolders => self.query_view(inv, View::Folders).await,
            CreateFile => self.create(inv, false).await,
            CreateFolder => self.create(inv, true).await,
            QueryGetRemoteObject => self.get_remote_object(inv).await,
            Delete => self.delete(inv).await,
            DeleteBatch => self.delete_batch(inv).await,
            Rename => self.rename(inv).await,
            Copy => self.copy(inv).await,
            CopyBatch => self.copy_batch(inv).await,
            Search => self.search(inv).await,
            SetReadOnly => self.set_readonly(inv).await,
            SetLastModified => self.set_last_modified(inv).await,
            QueryBasicProperty => {
                let path = self.resolve(inv.subject())?;
                refresh_element(inv.store(), inv.subject(), &path).await
            }
            QueryCanWriteProperty => {
                let props = FileProperties::of(&self.resolve(inv.subject())?).await;
                inv.add_result(PROPERTY_TYPE, "canWrite", props.exists && !props.readonly)?;
                Ok(())
            }
            QueryAdvanceProperty => self.advanced_properties(inv).await,
            QueryFileClassification => {
                let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
                inv.add_result(PROPERTY_TYPE, "classification", classify(&path).await?)?;
                Ok(())
            }
            QueryExists => {
                let path = self.resolve(inv.subject())?;
                inv.add_result(PROPERTY_TYPE, "exists", fs::try_exists(&path).await.unwrap_or(false))?;
                Ok(())
            }
            GetOsType => {
                inv.add_result(PROPERTY_TYPE, "osType", std::env::consts::OS)?;
                Ok(())
            }
            DownloadFile => self.download(inv).await,
            SystemEncoding => {
                inv.add_result(PROPERTY_TYPE, "encoding", self.system_encoding.as_str())?;
                Ok(())
            }
            QueryUnusedPort => {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                inv.add_result(PROPERTY_TYPE, "port", i64::from(port))?;
                Ok(())
            }
            StartSpirit => {
                inv.store().context().set_spirit_enabled(true);
                inv.add_result(PROPERTY_TYPE, "spirit", true)?;
                Ok(())
            }
            other => Err(DStoreError::UnknownCommand(other.to_string())),
        }
    }

    fn resolve(&self, element: &Element) -> Result<PathBuf> {
        normalize_path(&element_path(element), &self.files_root)
    }

    async fn query_roots(&self, inv: &Invocation) -> Result<()> {
        let store = inv.store();
        store.remove_children(inv.subject())?;
        for root in roots() {
            describe(store, inv.subject(), &root).await?;
        }
        Ok(())
    }

    async fn query_view(&self, inv: &Invocation, view: View) -> Result<()> {
        let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let filter = match inv.arg_value(0).filter(|p| !p.is_empty() && p != "*") {
            Some(pattern) => Some(wildcard_regex(&pattern)?),
            None => None,
        };

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !view.admits(is_dir) {
                continue;
            }
            // Folders stay visible so the tree can still be walked.
            if let Some(filter) = &filter {
                if !is_dir && !filter.is_match(&name) {
                    continue;
                }
            }
            entries.push(entry.path());
        }
        entries.sort();
        debug!(path = %path.display(), count = entries.len(), "Listed folder");

        let store = inv.store();
        store.remove_children(inv.subject())?;
        for entry in entries {
            if inv.is_cancelled() {
                return Err(DStoreError::Cancelled("folder query".to_string()));
            }
            describe(store, inv.subject(), &entry).await?;
        }
        refresh_element(store, inv.subject(), &path).await
    }

    async fn create(&self, inv: &Invocation, folder: bool) -> Result<()> {
        let path = creatable_path(&element_path(inv.subject()), &self.files_root)?;
        if folder {
            fs::create_dir_all(&path).await?;
        } else {
            fs::OpenOptions::new().write(true).create_new(true).open(&path).await?;
        }
        refresh_element(inv.store(), inv.subject(), &path).await
    }

    async fn get_remote_object(&self, inv: &Invocation) -> Result<()> {
        let requested = inv.arg_value(0).unwrap_or_default();
        let path = normalize_path(&requested, &self.files_root)?;
        describe(inv.store(), inv.status(), &path).await?;
        Ok(())
    }

    async fn delete(&self, inv: &Invocation) -> Result<()> {
        let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
        remove_path(&path).await?;
        let store = inv.store();
        if inv.subject().parent().is_some() && !is_well_known(inv.subject()) {
            store.remove(inv.subject())?;
        }
        Ok(())
    }

    async fn delete_batch(&self, inv: &Invocation) -> Result<()> {
        for item in inv.args() {
            if inv.is_cancelled() {
                return Err(DStoreError::Cancelled("batch delete".to_string()));
            }
            let remote = element_path(item);
            let outcome = match existing_path(&remote, &self.files_root) {
                Ok(path) => remove_path(&path).await,
                Err(e) => Err(e),
            };
            record_item(inv, &remote, outcome)?;
        }
        Ok(())
    }

    async fn rename(&self, inv: &Invocation) -> Result<()> {
        let source = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let new_name = inv.arg_value(0).unwrap_or_default();
        let target = if new_name.contains('/') {
            normalize_path(&new_name, &self.files_root)?
        } else {
            let parent = source.parent().unwrap_or(&self.files_root);
            normalize_path(&new_name, parent)?
        };
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(DStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("Target already exists: {}", target.display()),
            )));
        }
        fs::rename(&source, &target).await?;
        debug!(from = %source.display(), to = %target.display(), "Renamed");

        let store = inv.store();
        let (name, folder) = split_path(&target);
        store.set_attribute(inv.subject(), Attribute::Name, name)?;
        store.set_attribute(inv.subject(), Attribute::Value, folder)?;
        refresh_element(store, inv.subject(), &target).await
    }

    async fn copy(&self, inv: &Invocation) -> Result<()> {
        let source = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let Some(target_folder) = inv.arg(0) else {
            return Err(DStoreError::InvalidArgument("copy needs a target folder".to_string()));
        };
        let folder = existing_path(&element_path(target_folder), &self.files_root)?;
        let name = match inv.arg_value(1).filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => split_path(&source).0,
        };
        let target = folder.join(name);
        copy_recursive(&source, &target, inv).await?;
        describe(inv.store(), inv.status(), &target).await?;
        Ok(())
    }

    async fn copy_batch(&self, inv: &Invocation) -> Result<()> {
        let folder = existing_path(&element_path(inv.subject()), &self.files_root)?;
        for item in inv.args() {
            if inv.is_cancelled() {
                return Err(DStoreError::Cancelled("batch copy".to_string()));
            }
            let remote = element_path(item);
            let outcome = match existing_path(&remote, &self.files_root) {
                Ok(source) => {
                    let target = folder.join(split_path(&source).0);
                    copy_recursive(&source, &target, inv).await
                }
                Err(e) => Err(e),
            };
            record_item(inv, &remote, outcome)?;
        }
        Ok(())
    }

    async fn search(&self, inv: &Invocation) -> Result<()> {
        let root = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let names = wildcard_regex(&inv.arg_value(0).unwrap_or_else(|| "*".to_string()))?;
        let content = match inv.arg_value(1).filter(|p| !p.is_empty()) {
            Some(pattern) => Some(
                Regex::new(&pattern)
                    .map_err(|e| DStoreError::InvalidArgument(format!("bad search expression: {}", e)))?,
            ),
            None => None,
        };

        let mut dirs_to_visit = vec![root];
        let mut hits = 0usize;
        while let Some(dir) = dirs_to_visit.pop() {
            if inv.is_cancelled() {
                return Err(DStoreError::Cancelled("search".to_string()));
            }
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Could not read directory during search");
                    continue;
                }
            };
            let mut entries = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                entries.push(entry);
            }
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let path = entry.path();
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    dirs_to_visit.push(path.clone());
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !names.is_match(&name) {
                    continue;
                }
                let shown = path.display().to_string();
                match &content {
                    None => {
                        inv.add_result(SEARCH_RESULT_TYPE, &name, shown.as_str())?;
                        hits += 1;
                    }
                    Some(expr) if !is_dir => {
                        let Ok(file) = fs::File::open(&path).await else { continue };
                        let mut reader = BufReader::new(file);
                        let mut raw = Vec::new();
                        let mut line_no = 0i64;
                        loop {
                            raw.clear();
                            match reader.read_until(b'\n', &mut raw).await {
                                Ok(0) => break,
                                Ok(_) => {}
                                Err(e) => {
                                    debug!(file = %shown, error = %e, "Stopped reading during search");
                                    break;
                                }
                            }
                            line_no += 1;
                            let text = String::from_utf8_lossy(&raw);
                            let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
                            if expr.is_match(line) {
                                let hit = inv.add_result(SEARCH_RESULT_TYPE, &shown, line)?;
                                inv.store().set_attribute(&hit, Attribute::Source, line_no)?;
                                hits += 1;
                            }
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        debug!(hits, "Search finished");
        Ok(())
    }

    async fn set_readonly(&self, inv: &Invocation) -> Result<()> {
        let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let readonly = inv
            .arg(0)
            .and_then(|a| a.typed_value().as_bool())
            .ok_or_else(|| DStoreError::InvalidArgument("C_SET_READONLY needs true or false".to_string()))?;
        let mut permissions = fs::metadata(&path).await?.permissions();
        permissions.set_readonly(readonly);
        fs::set_permissions(&path, permissions).await?;
        refresh_element(inv.store(), inv.subject(), &path).await
    }

    async fn set_last_modified(&self, inv: &Invocation) -> Result<()> {
        let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let millis = inv
            .arg(0)
            .and_then(|a| a.typed_value().as_i64())
            .filter(|m| *m >= 0)
            .ok_or_else(|| DStoreError::InvalidArgument("C_SET_LASTMODIFIED needs epoch milliseconds".to_string()))?;
        let when = UNIX_EPOCH + Duration::from_millis(millis as u64);
        let target = path.clone();
        tokio::task::spawn_blocking(move || std::fs::File::open(&target)?.set_modified(when))
            .await
            .map_err(|e| DStoreError::RemoteExecution(format!("set modified task failed: {}", e)))??;
        refresh_element(inv.store(), inv.subject(), &path).await
    }

    async fn advanced_properties(&self, inv: &Invocation) -> Result<()> {
        let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let metadata = fs::metadata(&path).await?;
        let to_iso = |st: std::io::Result<SystemTime>| {
            st.ok()
                .map(chrono::DateTime::<chrono::Utc>::from)
                .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        };

        inv.add_result(PROPERTY_TYPE, "size", metadata.len() as i64)?;
        for (name, time) in [
            ("modified", to_iso(metadata.modified())),
            ("created", to_iso(metadata.created())),
            ("accessed", to_iso(metadata.accessed())),
        ] {
            if let Some(time) = time {
                inv.add_result(PROPERTY_TYPE, name, time)?;
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            inv.add_result(
                PROPERTY_TYPE,
                "permissions",
                format!("{:03o}", metadata.permissions().mode() & 0o777),
            )?;
        }
        if metadata.is_file() {
            let mime = mime_guess::from_path(&path).first_or_octet_stream().to_string();
            inv.add_result(PROPERTY_TYPE, "mimeType", mime)?;
        }
        Ok(())
    }

    /// Streams the subject to the path given in the first argument. Failures
    /// become a classification marker under the status rather than an error.
    async fn download(&self, inv: &Invocation) -> Result<()> {
        match self.stream_file(inv).await {
            Ok(sent) => {
                inv.add_result(DOWNLOAD_RESULT_SUCCESS_TYPE, DOWNLOAD_RESULT_SUCCESS_MESSAGE, sent as i64)?;
                Ok(())
            }
            Err(e) if e.is_cancelled() || e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Download failed");
                let class = e.download_class();
                inv.add_result(class, class, e.to_string())?;
                Ok(())
            }
        }
    }

    async fn stream_file(&self, inv: &Invocation) -> Result<u64> {
        let path = existing_path(&element_path(inv.subject()), &self.files_root)?;
        let destination = inv
            .arg_value(0)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| DStoreError::InvalidArgument("download needs a destination".to_string()))?;
        let text_mode = inv.arg(1).and_then(|a| a.typed_value().as_i64()) == Some(TEXT_MODE as i64);
        let mut sender = ChunkSender::new(inv, &destination);

        if text_mode {
            let source_encoding = lookup_encoding(&self.system_encoding)?;
            let target_encoding = match inv.arg_value(2).filter(|e| !e.is_empty()) {
                Some(label) => lookup_encoding(&label)?,
                None => UTF_8,
            };
            let style = scan_line_endings(&path, source_encoding, inv).await?;
            let mut decoder = source_encoding.new_decoder();
            let mut encoder = target_encoding.new_encoder();
            let mut normalizer = LineEndingNormalizer::new(style);
            let mut file = fs::File::open(&path).await?;
            let mut buf = vec![0u8; BUFFER_SIZE];
            loop {
                check_cancelled(inv)?;
                let n = file.read(&mut buf).await?;
                let last = n == 0;
                let text = decode_piece(&mut decoder, &buf[..n], last);
                let mut normalized = String::with_capacity(text.len() + 2);
                normalizer.feed(&text, &mut normalized);
                if last {
                    normalizer.finish(&mut normalized);
                }
                sender.send(&encode_piece(&mut encoder, &normalized, last)).await?;
                if last {
                    break;
                }
            }
            let sent = sender.finish().await?;
            debug!(bytes = sent, destination = %destination, "Text download sent");
            return Ok(sent);
        }

        let mut file = fs::File::open(&path).await?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            check_cancelled(inv)?;
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sender.send(&buf[..n]).await?;
        }
        let sent = sender.finish().await?;
        debug!(bytes = sent, destination = %destination, "Binary download sent");
        Ok(sent)
    }
}

fn check_cancelled(inv: &Invocation) -> Result<()> {
    if inv.is_cancelled() {
        return Err(DStoreError::Cancelled("download".to_string()));
    }
    Ok(())
}

/// Sends file content as consecutive chunks of at most `BUFFER_SIZE` bytes.
struct ChunkSender<'a> {
    inv: &'a Invocation,
    destination: &'a str,
    offset: u64,
}

impl<'a> ChunkSender<'a> {
    fn new(inv: &'a Invocation, destination: &'a str) -> Self {
        Self { inv, destination, offset: 0 }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(BUFFER_SIZE) {
            check_cancelled(self.inv)?;
            self.inv
                .store()
                .transfer(self.inv.status(), self.destination, self.offset, chunk.to_vec())
                .await?;
            self.offset += chunk.len() as u64;
        }
        Ok(())
    }

    /// An empty file still creates the destination.
    async fn finish(self) -> Result<u64> {
        if self.offset == 0 {
            self.inv
                .store()
                .transfer(self.inv.status(), self.destination, 0, Vec::new())
                .await?;
        }
        Ok(self.offset)
    }
}

/// First pass over a text file: which line ending it mostly uses.
async fn scan_line_endings(path: &Path, encoding: &'static Encoding, inv: &Invocation) -> Result<LineEndingStyle> {
    let mut decoder = encoding.new_decoder();
    let mut counter = LineEndingCounter::default();
    let mut file = fs::File::open(path).await?;
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        check_cancelled(inv)?;
        let n = file.read(&mut buf).await?;
        counter.feed(&decode_piece(&mut decoder, &buf[..n], n == 0));
        if n == 0 {
            return Ok(counter.finish());
        }
    }
}

fn decode_piece(decoder: &mut Decoder, src: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(src.len())
        .unwrap_or(src.len().saturating_mul(3))
        + 4;
    let mut out = String::with_capacity(capacity);
    let mut src = src;
    loop {
        let (result, read, _) = decoder.decode_to_string(src, &mut out, last);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return out,
            CoderResult::OutputFull => out.reserve(src.len().saturating_mul(3) + 16),
        }
    }
}

fn encode_piece(encoder: &mut Encoder, src: &str, last: bool) -> Vec<u8> {
    let capacity = encoder
        .max_buffer_length_from_utf8_if_no_unmappables(src.len())
        .unwrap_or(src.len())
        + 16;
    let mut out = Vec::with_capacity(capacity);
    let mut src = src;
    loop {
        let (result, read, _) = encoder.encode_from_utf8_to_vec(src, &mut out, last);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return out,
            CoderResult::OutputFull => out.reserve(src.len().saturating_mul(4) + 16),
        }
    }
}

fn lookup_encoding(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| DStoreError::InvalidArgument(format!("unsupported encoding: {}", label)))
}

fn roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        ('A'..='Z')
            .map(|d| PathBuf::from(format!("{}:\\", d)))
            .filter(|p| p.exists())
            .collect()
    } else {
        vec![PathBuf::from("/")]
    }
}

fn is_well_known(element: &Element) -> bool {
    element.id().as_str().starts_with("root")
}

/// Adds a file or folder element for `path` below `parent`.
async fn describe(store: &DataStore, parent: &Element, path: &Path) -> Result<Element> {
    let props = FileProperties::of(path).await;
    let kind = if props.is_dir {
        UNIVERSAL_FOLDER_DESCRIPTOR
    } else {
        UNIVERSAL_FILE_DESCRIPTOR
    };
    let (name, folder) = split_path(path);
    let element = store.create(parent, kind, &name, folder)?;
    store.set_attribute(&element, Attribute::Source, props.to_source())?;
    Ok(element)
}

async fn refresh_element(store: &DataStore, element: &Element, path: &Path) -> Result<()> {
    let props = FileProperties::of(path).await;
    let kind = if props.is_dir {
        UNIVERSAL_FOLDER_DESCRIPTOR
    } else {
        UNIVERSAL_FILE_DESCRIPTOR
    };
    if props.exists && element.kind() != kind && element.kind() != "root" {
        store.set_attribute(element, Attribute::Type, kind)?;
    }
    store.set_attribute(element, Attribute::Source, props.to_source())
}

async fn remove_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    debug!(path = %path.display(), "Deleted");
    Ok(())
}

async fn copy_recursive(source: &Path, target: &Path, inv: &Invocation) -> Result<()> {
    if target.starts_with(source) && target != source {
        return Err(DStoreError::InvalidArgument(format!(
            "cannot copy {} into itself",
            source.display()
        )));
    }
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        if inv.is_cancelled() {
            return Err(DStoreError::Cancelled("copy".to_string()));
        }
        if fs::metadata(&from).await?.is_dir() {
            fs::create_dir_all(&to).await?;
            let mut read_dir = fs::read_dir(&from).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                pending.push((entry.path(), to.join(entry.file_name())));
            }
        } else {
            fs::copy(&from, &to).await?;
        }
    }
    debug!(from = %source.display(), to = %target.display(), "Copied");
    Ok(())
}

/// One entry of a batch result.
fn record_item(inv: &Invocation, remote: &str, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => inv.add_result(PROPERTY_TYPE, remote, true)?,
        Err(e) => {
            debug!(path = %remote, error = %e, "Batch item failed");
            inv.add_result(ERROR_TYPE, error_kind(&e), format!("{}: {}", remote, e))?
        }
    };
    Ok(())
}

async fn classify(path: &Path) -> Result<String> {
    let metadata = fs::symlink_metadata(path).await?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path).await?;
        return Ok(format!("symbolic link to {}", target.display()));
    }
    if metadata.is_dir() {
        return Ok("directory".to_string());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 != 0 {
            return Ok("executable".to_string());
        }
    }
    Ok("file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::DStoreContext;
    use crate::dispatcher::CommandDispatcher;
    use crate::store::{delta_channel, Delta, StatusState};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: Arc<DataStore>,
        dispatcher: Arc<CommandDispatcher>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let ctx = DStoreContext::new(Arc::new(Config::for_root(&root)));
        let store = DataStore::new(ctx, "srv");
        let dispatcher = CommandDispatcher::new(store.clone());
        dispatcher
            .register_miner(Arc::new(FileSystemMiner::new(root.clone(), "UTF-8")))
            .unwrap();
        Fixture {
            _dir: dir,
            root,
            store,
            dispatcher,
        }
    }

    impl Fixture {
        fn folder(&self, path: &Path) -> Element {
            let (name, folder) = split_path(path);
            self.store
                .create(self.store.temp_root(), UNIVERSAL_FOLDER_DESCRIPTOR, &name, folder)
                .unwrap()
        }

        fn file(&self, path: &Path) -> Element {
            let (name, folder) = split_path(path);
            self.store
                .create(self.store.temp_root(), UNIVERSAL_FILE_DESCRIPTOR, &name, folder)
                .unwrap()
        }

        fn arg(&self, value: impl Into<crate::store::ElementValue>) -> Element {
            self.store.create(self.store.temp_root(), ARGUMENT_TYPE, "arg", value).unwrap()
        }

        async fn run(&self, command: &str, subject: &Element, args: &[Element]) -> Element {
            let status = self.dispatcher.handle(command, subject, args).unwrap();
            self.dispatcher.run_pending();
            for _ in 0..500 {
                if self.store.status_state(&status).is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(self.store.status_state(&status), StatusState::Done);
            status
        }
    }

    fn property(status: &Element, name: &str) -> Option<String> {
        status
            .children_of_type(PROPERTY_TYPE)
            .into_iter()
            .find(|p| p.name() == name)
            .map(|p| p.value())
    }

    #[test]
    fn properties_survive_the_source_attribute() {
        let props = FileProperties {
            exists: true,
            is_dir: false,
            size: 42,
            modified_ms: 1_700_000_000_000,
            readonly: true,
            hidden: false,
        };
        assert_eq!(FileProperties::from_source(&props.to_source()), Some(props));
        assert_eq!(FileProperties::from_source("garbage"), None);
    }

    #[test]
    fn wildcards_are_anchored() {
        let re = wildcard_regex("*.rs").unwrap();
        assert!(re.is_match("main.rs"));
        assert!(!re.is_match("main.rs.bak"));
        assert!(wildcard_regex("a?c").unwrap().is_match("abc"));
        assert!(wildcard_regex("a+b").unwrap().is_match("a+b"));
    }

    #[tokio::test]
    async fn view_lists_sorted_children_with_filter() {
        let fx = fixture();
        std::fs::write(fx.root.join("b.txt"), "b").unwrap();
        std::fs::write(fx.root.join("a.rs"), "a").unwrap();
        std::fs::create_dir(fx.root.join("sub")).unwrap();
        let folder = fx.folder(&fx.root);

        fx.run("C_QUERY_VIEW_ALL", &folder, &[]).await;
        let names: Vec<String> = folder.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["a.rs", "b.txt", "sub"]);
        assert_eq!(folder.children()[2].kind(), UNIVERSAL_FOLDER_DESCRIPTOR);

        let pattern = fx.arg("*.txt");
        fx.run("C_QUERY_VIEW_FILES", &folder, &[pattern]).await;
        let names: Vec<String> = folder.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["b.txt"]);
        let props = FileProperties::from_source(&folder.children()[0].source()).unwrap();
        assert_eq!(props.size, 1);
    }

    #[tokio::test]
    async fn create_rename_and_delete() {
        let fx = fixture();
        let file = fx.file(&fx.root.join("new.txt"));
        fx.run("C_CREATE_FILE", &file, &[]).await;
        assert!(fx.root.join("new.txt").is_file());
        assert!(FileProperties::from_source(&file.source()).unwrap().exists);

        let new_name = fx.arg("renamed.txt");
        fx.run("C_RENAME", &file, &[new_name]).await;
        assert!(fx.root.join("renamed.txt").is_file());
        assert_eq!(file.name(), "renamed.txt");

        fx.run("C_DELETE", &file, &[]).await;
        assert!(!fx.root.join("renamed.txt").exists());
        assert!(file.is_removed());
    }

    #[tokio::test]
    async fn creating_an_existing_file_reports_an_error() {
        let fx = fixture();
        std::fs::write(fx.root.join("x"), "").unwrap();
        let file = fx.file(&fx.root.join("x"));
        let status = fx.run("C_CREATE_FILE", &file, &[]).await;
        assert_eq!(status.children_of_type(ERROR_TYPE)[0].name(), "IOException");
    }

    #[tokio::test]
    async fn batch_delete_reports_each_item() {
        let fx = fixture();
        std::fs::write(fx.root.join("one"), "1").unwrap();
        let items = vec![fx.file(&fx.root.join("one")), fx.file(&fx.root.join("missing"))];
        let status = fx.run("C_DELETE_BATCH", fx.store.host_root(), &items).await;
        assert_eq!(status.children_of_type(PROPERTY_TYPE).len(), 1);
        let errors = status.children_of_type(ERROR_TYPE);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].value().contains("missing"));
        assert!(!fx.root.join("one").exists());
    }

    #[tokio::test]
    async fn copy_folder_recursively() {
        let fx = fixture();
        std::fs::create_dir_all(fx.root.join("src/inner")).unwrap();
        std::fs::write(fx.root.join("src/inner/f.txt"), "data").unwrap();
        std::fs::create_dir(fx.root.join("dst")).unwrap();
        let source = fx.folder(&fx.root.join("src"));
        let target = fx.folder(&fx.root.join("dst"));
        let status = fx.run("C_COPY", &source, &[target]).await;
        assert_eq!(std::fs::read_to_string(fx.root.join("dst/src/inner/f.txt")).unwrap(), "data");
        assert_eq!(status.children_of_type(UNIVERSAL_FOLDER_DESCRIPTOR)[0].name(), "src");
    }

    #[tokio::test]
    async fn search_by_name_and_content() {
        let fx = fixture();
        std::fs::create_dir(fx.root.join("d")).unwrap();
        std::fs::write(fx.root.join("d/a.rs"), "fn main() {}\nlet x = 1;\n").unwrap();
        std::fs::write(fx.root.join("b.txt"), "fn nope").unwrap();
        let folder = fx.folder(&fx.root);

        let status = fx.run("C_SEARCH", &folder, &[fx.arg("*.rs")]).await;
        let hits = status.children_of_type(SEARCH_RESULT_TYPE);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), "a.rs");

        let status = fx.run("C_SEARCH", &folder, &[fx.arg("*"), fx.arg("^let")]).await;
        let hits = status.children_of_type(SEARCH_RESULT_TYPE);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value(), "let x = 1;");
        assert_eq!(hits[0].source(), "2");
    }

    #[tokio::test]
    async fn simple_queries() {
        let fx = fixture();
        std::fs::write(fx.root.join("f"), "x").unwrap();
        let file = fx.file(&fx.root.join("f"));

        let status = fx.run("C_QUERY_EXISTS", &file, &[]).await;
        assert_eq!(property(&status, "exists").as_deref(), Some("true"));
        let status = fx.run("C_GET_OSTYPE", &file, &[]).await;
        assert_eq!(property(&status, "osType").as_deref(), Some(std::env::consts::OS));
        let status = fx.run("C_SYSTEM_ENCODING", &file, &[]).await;
        assert_eq!(property(&status, "encoding").as_deref(), Some("UTF-8"));
        let status = fx.run("C_QUERY_UNUSED_PORT", &file, &[]).await;
        assert!(property(&status, "port").unwrap().parse::<u16>().unwrap() > 0);
        let status = fx.run("C_QUERY_FILE_CLASSIFICATION", &file, &[]).await;
        assert_eq!(property(&status, "classification").as_deref(), Some("file"));
        let status = fx.run("C_QUERY_ADVANCE_PROPERTY", &file, &[]).await;
        assert_eq!(property(&status, "size").as_deref(), Some("1"));

        let when = fx.arg(1_600_000_000_000i64);
        fx.run("C_SET_LASTMODIFIED", &file, &[when]).await;
        assert_eq!(FileProperties::from_source(&file.source()).unwrap().modified_ms, 1_600_000_000_000);

        let status = fx.run("C_START_SPIRIT", fx.store.host_root(), &[]).await;
        assert_eq!(property(&status, "spirit").as_deref(), Some("true"));
        assert!(fx.store.context().spirit_enabled());
    }

    #[tokio::test]
    async fn get_remote_object_describes_missing_paths() {
        let fx = fixture();
        let status = fx
            .run("C_QUERY_GET_REMOTE_OBJECT", fx.store.host_root(), &[fx.arg("nothing.here")])
            .await;
        let file = &status.children_of_type(UNIVERSAL_FILE_DESCRIPTOR)[0];
        assert_eq!(file.name(), "nothing.here");
        assert!(!FileProperties::from_source(&file.source()).unwrap().exists);
    }

    #[tokio::test]
    async fn binary_download_streams_chunks_in_order() {
        let fx = fixture();
        let (tx, mut rx) = delta_channel();
        fx.store.set_mirror(tx);
        let payload: Vec<u8> = (0..(BUFFER_SIZE * 2 + 7)).map(|i| (i % 251) as u8).collect();
        std::fs::write(fx.root.join("blob"), &payload).unwrap();
        let file = fx.file(&fx.root.join("blob"));

        let dest = fx.arg("/local/blob");
        let mode = fx.arg(BINARY_MODE as i64);
        let status = fx.run("C_DOWNLOAD_FILE", &file, &[dest, mode]).await;
        assert_eq!(
            status.children_of_type(DOWNLOAD_RESULT_SUCCESS_TYPE)[0].value(),
            payload.len().to_string()
        );

        let mut received = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            if let Delta::Transfer { offset, data, destination, .. } = delta {
                assert_eq!(destination, "/local/blob");
                assert_eq!(offset as usize, received.len());
                received.extend(data);
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn text_download_transcodes_and_unifies_line_endings() {
        let fx = fixture();
        let (tx, mut rx) = delta_channel();
        fx.store.set_mirror(tx);
        std::fs::write(fx.root.join("t.txt"), "caf\u{e9}\r\nb\r\nc\n").unwrap();
        let file = fx.file(&fx.root.join("t.txt"));

        let args = [fx.arg("/local/t.txt"), fx.arg(TEXT_MODE as i64), fx.arg("ISO-8859-1")];
        fx.run("C_DOWNLOAD_FILE", &file, &args).await;

        let mut received = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            if let Delta::Transfer { data, .. } = delta {
                received.extend(data);
            }
        }
        assert_eq!(received, b"caf\xe9\r\nb\r\nc\r\n".to_vec());
    }

    #[tokio::test]
    async fn large_text_download_waits_for_the_reader() {
        let fx = fixture();
        let (tx, mut rx) = delta_channel();
        fx.store.set_mirror(tx);
        // Every CRLF straddles a read boundary.
        let line = format!("{}\r\n", "x".repeat(BUFFER_SIZE - 1));
        let body = line.repeat(crate::store::delta::TRANSFER_WINDOW * 3);
        std::fs::write(fx.root.join("big.txt"), &body).unwrap();
        let file = fx.file(&fx.root.join("big.txt"));

        let args = [fx.arg("/local/big.txt"), fx.arg(TEXT_MODE as i64)];
        let status = fx.dispatcher.handle("C_DOWNLOAD_FILE", &file, &args).unwrap();
        fx.dispatcher.run_pending();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fx.store.status_state(&status).is_terminal());

        let mut received = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(Delta::Transfer { offset, data, .. })) => {
                    assert_eq!(offset as usize, received.len());
                    received.extend(data);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        assert_eq!(received, body.as_bytes());
        assert_eq!(fx.store.status_state(&status), StatusState::Done);
        assert_eq!(
            status.children_of_type(DOWNLOAD_RESULT_SUCCESS_TYPE)[0].value(),
            body.len().to_string()
        );
    }

    #[tokio::test]
    async fn missing_download_is_classified() {
        let fx = fixture();
        let file = fx.file(&fx.root.join("absent"));
        let status = fx.run("C_DOWNLOAD_FILE", &file, &[fx.arg("/local/x")]).await;
        assert_eq!(
            status.children_of_type(DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION).len(),
            1
        );
        assert!(status.children_of_type(ERROR_TYPE).is_empty());
    }
}

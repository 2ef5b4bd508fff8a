use crate::error::{DStoreError, Result};
use crate::monitor::{DownloadListener, ProgressMonitor, WaitOutcome};
use crate::protocol::constants::{
    CommandName, BINARY_MODE, ERROR_TYPE, PROPERTY_TYPE, SEARCH_RESULT_TYPE, TEXT_MODE, UNIVERSAL_FILE_DESCRIPTOR,
    UNIVERSAL_FOLDER_DESCRIPTOR,
};
use crate::services::connection::ClientConnection;
use crate::services::{BatchItem, FileCapability, HostFile, ListKind, SearchHit, TransferMode};
use crate::store::Element;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// File operations against the remote host's file system miner.
pub struct DStoreFileService {
    conn: Arc<ClientConnection>,
}

impl DStoreFileService {
    pub fn new(conn: Arc<ClientConnection>) -> Self {
        Self { conn }
    }

    async fn run(&self, command: CommandName, subject: &Element, args: &[Element]) -> Result<Element> {
        self.conn.run(command.as_str(), subject, args).await
    }

    async fn host_query(&self, command: CommandName, property: &str) -> Result<String> {
        let host = self.conn.store().host_root().clone();
        let status = self.run(command, &host, &[]).await?;
        property_value(&status, property)
            .ok_or_else(|| DStoreError::RemoteExecution(format!("{} returned no {}", command, property)))
    }
}

fn property_value(status: &Element, name: &str) -> Option<String> {
    status
        .children_of_type(PROPERTY_TYPE)
        .into_iter()
        .find(|p| p.name() == name)
        .map(|p| p.value())
}

fn file_children(element: &Element) -> Vec<HostFile> {
    element
        .children()
        .into_iter()
        .filter(|c| {
            let kind = c.kind();
            kind == UNIVERSAL_FILE_DESCRIPTOR || kind == UNIVERSAL_FOLDER_DESCRIPTOR
        })
        .map(HostFile::from_element)
        .collect()
}

/// One entry per batch item; failures carry the message recorded remotely.
fn batch_items(status: &Element) -> Vec<BatchItem> {
    status
        .children()
        .into_iter()
        .filter_map(|c| match c.kind().as_str() {
            PROPERTY_TYPE => Some(BatchItem {
                path: c.name(),
                error: None,
            }),
            ERROR_TYPE => {
                let value = c.value();
                let (path, message) = value.split_once(": ").unwrap_or(("", value.as_str()));
                Some(BatchItem {
                    path: path.to_string(),
                    error: Some(message.to_string()),
                })
            }
            _ => None,
        })
        .collect()
}

#[async_trait]
impl FileCapability for DStoreFileService {
    async fn roots(&self) -> Result<Vec<HostFile>> {
        let host = self.conn.store().host_root().clone();
        self.run(CommandName::QueryRoots, &host, &[]).await?;
        Ok(file_children(&host))
    }

    #[instrument(skip(self))]
    async fn list(&self, folder: &str, filter: Option<&str>, kind: ListKind) -> Result<Vec<HostFile>> {
        let command = match kind {
            ListKind::All => CommandName::QueryViewAll,
            ListKind::Files => CommandName::QueryViewFiles,
            ListKind::Folders => CommandName::QueryViewFolders,
        };
        let subject = self.conn.remote_object(folder, true)?;
        let args = match filter {
            Some(pattern) => vec![self.conn.argument(pattern)?],
            None => Vec::new(),
        };
        self.run(command, &subject, &args).await?;
        let children = file_children(&subject);
        debug!(count = children.len(), "Listed remote folder");
        Ok(children)
    }

    async fn get_file(&self, path: &str) -> Result<HostFile> {
        let host = self.conn.store().host_root().clone();
        let status = self
            .run(CommandName::QueryGetRemoteObject, &host, &[self.conn.argument(path)?])
            .await?;
        file_children(&status)
            .into_iter()
            .next()
            .ok_or_else(|| DStoreError::RemoteExecution(format!("no description returned for {}", path)))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let subject = self.conn.remote_object(path, false)?;
        let status = self.run(CommandName::QueryExists, &subject, &[]).await?;
        Ok(property_value(&status, "exists").as_deref() == Some("true"))
    }

    async fn create_file(&self, path: &str) -> Result<HostFile> {
        let subject = self.conn.remote_object(path, false)?;
        self.run(CommandName::CreateFile, &subject, &[]).await?;
        Ok(HostFile::from_element(subject))
    }

    async fn create_folder(&self, path: &str) -> Result<HostFile> {
        let subject = self.conn.remote_object(path, true)?;
        self.run(CommandName::CreateFolder, &subject, &[]).await?;
        Ok(HostFile::from_element(subject))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let subject = self.conn.remote_object(path, false)?;
        self.run(CommandName::Delete, &subject, &[]).await?;
        Ok(())
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<Vec<BatchItem>> {
        let host = self.conn.store().host_root().clone();
        let items = paths
            .iter()
            .map(|p| self.conn.remote_object(p, false))
            .collect::<Result<Vec<_>>>()?;
        let status = self.conn.command(CommandName::DeleteBatch.as_str(), &host, &items)?;
        wait_batch(&self.conn, &status).await
    }

    async fn rename(&self, path: &str, new_name: &str) -> Result<HostFile> {
        let subject = self.conn.remote_object(path, false)?;
        self.run(CommandName::Rename, &subject, &[self.conn.argument(new_name)?])
            .await?;
        Ok(HostFile::from_element(subject))
    }

    async fn copy(&self, source: &str, target_folder: &str, new_name: Option<&str>) -> Result<HostFile> {
        let subject = self.conn.remote_object(source, false)?;
        let mut args = vec![self.conn.remote_object(target_folder, true)?];
        if let Some(name) = new_name {
            args.push(self.conn.argument(name)?);
        }
        let status = self.run(CommandName::Copy, &subject, &args).await?;
        file_children(&status)
            .into_iter()
            .next()
            .ok_or_else(|| DStoreError::RemoteExecution(format!("copy of {} returned nothing", source)))
    }

    async fn copy_batch(&self, sources: &[String], target_folder: &str) -> Result<Vec<BatchItem>> {
        let subject = self.conn.remote_object(target_folder, true)?;
        let items = sources
            .iter()
            .map(|p| self.conn.remote_object(p, false))
            .collect::<Result<Vec<_>>>()?;
        let status = self.conn.command(CommandName::CopyBatch.as_str(), &subject, &items)?;
        wait_batch(&self.conn, &status).await
    }

    #[instrument(skip(self))]
    async fn search(&self, folder: &str, name_pattern: &str, content: Option<&str>) -> Result<Vec<SearchHit>> {
        let subject = self.conn.remote_object(folder, true)?;
        let mut args = vec![self.conn.argument(name_pattern)?];
        if let Some(expr) = content {
            args.push(self.conn.argument(expr)?);
        }
        let status = self.run(CommandName::Search, &subject, &args).await?;
        Ok(status
            .children_of_type(SEARCH_RESULT_TYPE)
            .into_iter()
            .map(|hit| match content {
                None => SearchHit {
                    path: hit.value(),
                    line: None,
                },
                Some(_) => SearchHit {
                    path: hit.name(),
                    line: Some((hit.source().parse().unwrap_or(0), hit.value())),
                },
            })
            .collect())
    }

    async fn set_readonly(&self, path: &str, readonly: bool) -> Result<()> {
        let subject = self.conn.remote_object(path, false)?;
        self.run(CommandName::SetReadOnly, &subject, &[self.conn.argument(readonly)?])
            .await?;
        Ok(())
    }

    async fn set_last_modified(&self, path: &str, millis: i64) -> Result<()> {
        let subject = self.conn.remote_object(path, false)?;
        self.run(CommandName::SetLastModified, &subject, &[self.conn.argument(millis)?])
            .await?;
        Ok(())
    }

    async fn properties(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let subject = self.conn.remote_object(path, false)?;
        let status = self.run(CommandName::QueryAdvanceProperty, &subject, &[]).await?;
        Ok(status
            .children_of_type(PROPERTY_TYPE)
            .into_iter()
            .map(|p| (p.name(), p.value()))
            .collect())
    }

    async fn classification(&self, path: &str) -> Result<String> {
        let subject = self.conn.remote_object(path, false)?;
        let status = self.run(CommandName::QueryFileClassification, &subject, &[]).await?;
        property_value(&status, "classification")
            .ok_or_else(|| DStoreError::RemoteExecution(format!("no classification for {}", path)))
    }

    #[instrument(skip(self, progress, cancel), fields(local = %local.display()))]
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        mode: TransferMode,
        encoding: Option<&str>,
        progress: Option<Arc<dyn ProgressMonitor>>,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let file = self.get_file(remote).await?;
        if !file.properties.exists {
            return Err(DStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("remote file not found: {}", remote),
            )));
        }
        let mode_value = match mode {
            TransferMode::Text => TEXT_MODE,
            TransferMode::Binary => BINARY_MODE,
        };
        let mut args = vec![
            self.conn.argument(local.display().to_string())?,
            self.conn.argument(i64::from(mode_value))?,
        ];
        if let Some(label) = encoding {
            args.push(self.conn.argument(label)?);
        }
        let status = self.conn.download_command(file.element(), &args, local)?;
        let status_id = status.id().clone();

        let listener = DownloadListener::new(status, local, file.properties.size, progress);
        let trip = listener.cancel_token();
        let caller = cancel.clone();
        let bridge = tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => trip.cancel(),
                _ = trip.cancelled() => {}
            }
        });
        let outcome = listener.wait(&self.conn.monitor()).await;
        bridge.abort();
        self.conn.downloads().forget(&status_id);

        let outcome = outcome?;
        if outcome == WaitOutcome::Done {
            if let Some((class, message)) = listener.failure() {
                return Err(DStoreError::RemoteExecution(format!("{}: {}", class, message)));
            }
        }
        Ok(outcome)
    }

    async fn os_type(&self) -> Result<String> {
        self.host_query(CommandName::GetOsType, "osType").await
    }

    async fn system_encoding(&self) -> Result<String> {
        self.host_query(CommandName::SystemEncoding, "encoding").await
    }

    async fn unused_port(&self) -> Result<u16> {
        let port = self.host_query(CommandName::QueryUnusedPort, "port").await?;
        port.parse()
            .map_err(|_| DStoreError::Protocol(format!("port property is not a number: {}", port)))
    }
}

/// Batches report failures per item, so an error child does not fail the
/// whole operation.
async fn wait_batch(conn: &ClientConnection, status: &Element) -> Result<Vec<BatchItem>> {
    match conn.wait(status, &CancellationToken::new()).await? {
        WaitOutcome::Done => Ok(batch_items(status)),
        WaitOutcome::Cancelled => Err(DStoreError::Cancelled("batch operation".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicU64, Ordering};

    async fn service(root: &Path) -> (Arc<ClientConnection>, DStoreFileService) {
        let conn = ClientConnection::local(Arc::new(Config::for_root(root))).await.unwrap();
        let service = DStoreFileService::new(conn.clone());
        (conn, service)
    }

    #[tokio::test]
    async fn listing_and_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let (conn, files) = service(dir.path()).await;

        files.create_folder(&format!("{}/sub", root)).await.unwrap();
        let created = files.create_file(&format!("{}/a.txt", root)).await.unwrap();
        assert!(created.properties.exists);
        assert!(files.create_file(&format!("{}/a.txt", root)).await.is_err());

        let all = files.list(&root, None, ListKind::All).await.unwrap();
        let names: Vec<String> = all.iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(all[1].is_dir());
        let folders = files.list(&root, None, ListKind::Folders).await.unwrap();
        assert_eq!(folders.len(), 1);

        let renamed = files.rename(&format!("{}/a.txt", root), "b.txt").await.unwrap();
        assert_eq!(renamed.name, "b.txt");
        assert!(files.exists(&format!("{}/b.txt", root)).await.unwrap());
        assert!(!files.exists(&format!("{}/a.txt", root)).await.unwrap());

        files.delete(&format!("{}/b.txt", root)).await.unwrap();
        assert!(!dir.path().join("b.txt").exists());
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn batch_delete_reports_per_item() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
        let (conn, files) = service(dir.path()).await;
        let existing = dir.path().join("keep.txt").display().to_string();
        let missing = dir.path().join("gone.txt").display().to_string();
        let items = files.delete_batch(&[existing.clone(), missing.clone()]).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], BatchItem { path: existing, error: None });
        assert_eq!(items[1].path, missing);
        assert!(items[1].error.is_some());
        conn.disconnect().await;
    }

    #[derive(Default)]
    struct Progress {
        worked: AtomicU64,
    }

    impl ProgressMonitor for Progress {
        fn worked(&self, units: u64) {
            self.worked.fetch_add(units, Ordering::SeqCst);
        }
        fn sub_task(&self, _message: &str) {}
        fn is_cancelled(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn binary_download_arrives_intact() {
        let remote_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..25_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(remote_dir.path().join("blob.bin"), &payload).unwrap();
        let (conn, files) = service(remote_dir.path()).await;

        let progress = Arc::new(Progress::default());
        let local = local_dir.path().join("blob.bin");
        let outcome = files
            .download(
                &remote_dir.path().join("blob.bin").display().to_string(),
                &local,
                TransferMode::Binary,
                None,
                Some(progress.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert_eq!(std::fs::read(&local).unwrap(), payload);
        assert_eq!(progress.worked.load(Ordering::SeqCst), payload.len() as u64);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn host_queries() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, files) = service(dir.path()).await;
        assert_eq!(files.os_type().await.unwrap(), std::env::consts::OS);
        assert_eq!(files.system_encoding().await.unwrap(), "UTF-8");
        assert!(files.unused_port().await.unwrap() > 0);
        conn.disconnect().await;
    }
}

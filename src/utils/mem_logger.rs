use crate::config::Config;
use crate::context::CounterSnapshot;
use crate::store::SweepReport;
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Appends element lifecycle statistics to a size-rotated file.
#[derive(Debug, Clone)]
pub struct MemLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl MemLogger {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create memory log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
        }
    }

    /// `None` unless `DSTORE_MEMLOG_FILE` is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .mem_log_file
            .as_ref()
            .map(|path| Self::new(path.clone(), config.mem_log_max_size_bytes))
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_sweep(&self, connection: &str, report: &SweepReport, totals: &CounterSnapshot) {
        if let Err(e) = self.try_log_sweep(connection, report, totals).await {
            error!(connection = %connection, error = %e, "Failed to write memory log");
        }
    }

    async fn try_log_sweep(&self, connection: &str, report: &SweepReport, totals: &CounterSnapshot) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let log_entry = format!(
            "{} | {:<8} | evicted={} drained={} queued={} | created={} disconnected={} reclaimed={}\n",
            Utc::now().to_rfc3339(),
            connection,
            report.evicted,
            report.drained,
            report.remaining,
            totals.created,
            totals.disconnected,
            totals.reclaimed,
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotates_when_over_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.log");
        let logger = MemLogger::new(path.clone(), 1);
        let report = SweepReport::default();
        let totals = CounterSnapshot::default();

        logger.log_sweep("c1", &report, &totals).await;
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("evicted=0"));

        logger.log_sweep("c1", &report, &totals).await;
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }
}

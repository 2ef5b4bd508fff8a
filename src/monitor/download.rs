use crate::error::{DStoreError, Result};
use crate::monitor::{EventPump, StatusMonitor, WaitOptions, WaitOutcome};
use crate::protocol::constants::{DOWNLOAD_RESULT_SUCCESS_TYPE, DOWNLOAD_RESULT_UNEXPECTED_ERROR, KB_IN_BYTES};
use crate::store::Element;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Receives download progress. Mirrors a UI progress monitor.
pub trait ProgressMonitor: Send + Sync {
    fn worked(&self, units: u64);
    fn sub_task(&self, message: &str);
    fn is_cancelled(&self) -> bool;
    fn done(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    /// Bytes gained since the previous report.
    pub worked: u64,
    pub percent: u64,
    pub message: String,
}

/// Turns byte counts into progress reports, one per strict increase.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    total_length: u64,
    notified: u64,
}

impl DownloadProgress {
    pub fn new(total_length: u64) -> Self {
        Self {
            total_length,
            notified: 0,
        }
    }

    pub fn notified(&self) -> u64 {
        self.notified
    }

    pub fn observe(&mut self, bytes_so_far: u64) -> Option<ProgressReport> {
        if bytes_so_far <= self.notified {
            return None;
        }
        let worked = bytes_so_far - self.notified;
        self.notified = bytes_so_far;
        let percent = if self.total_length == 0 {
            100
        } else {
            bytes_so_far.saturating_mul(100) / self.total_length
        };
        let kb = KB_IN_BYTES as u64;
        Some(ProgressReport {
            worked,
            percent,
            message: format!(
                "{} KB of {} KB complete ({}%)",
                bytes_so_far / kb,
                self.total_length / kb,
                percent
            ),
        })
    }
}

struct ProgressPump {
    local_file: PathBuf,
    progress: Mutex<DownloadProgress>,
    monitor: Option<Arc<dyn ProgressMonitor>>,
    cancel: CancellationToken,
}

impl ProgressPump {
    async fn update(&self) {
        let Some(monitor) = &self.monitor else { return };
        let length = match tokio::fs::metadata(&self.local_file).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let report = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(length);
        if let Some(report) = report {
            monitor.worked(report.worked);
            monitor.sub_task(&report.message);
        }
    }
}

#[async_trait]
impl EventPump for ProgressPump {
    async fn drain(&self) {
        if self.monitor.as_ref().is_some_and(|m| m.is_cancelled()) {
            self.cancel.cancel();
        }
        self.update().await;
    }
}

/// Follows one `C_DOWNLOAD_FILE` status while the local file grows.
pub struct DownloadListener {
    status: Element,
    pump: Arc<ProgressPump>,
}

impl DownloadListener {
    pub fn new(
        status: Element,
        local_file: impl Into<PathBuf>,
        total_length: u64,
        monitor: Option<Arc<dyn ProgressMonitor>>,
    ) -> Self {
        Self {
            status,
            pump: Arc::new(ProgressPump {
                local_file: local_file.into(),
                progress: Mutex::new(DownloadProgress::new(total_length)),
                monitor,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn status(&self) -> &Element {
        &self.status
    }

    pub fn local_file(&self) -> &Path {
        &self.pump.local_file
    }

    /// Trips the wait as if the progress monitor had been cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.pump.cancel.clone()
    }

    /// Waits for the download to finish. A cancelled download removes the
    /// partial local file; a dropped connection is reported as network down.
    #[instrument(skip(self, monitor), fields(status = %self.status.id(), file = %self.pump.local_file.display()))]
    pub async fn wait(&self, monitor: &StatusMonitor) -> Result<WaitOutcome> {
        let opts = WaitOptions::default().cooperative(self.pump.clone());
        let result = monitor.wait_for_update(&self.status, &self.pump.cancel, &opts).await;
        match result {
            Ok(WaitOutcome::Done) => {
                self.pump.update().await;
                if let Some(m) = &self.pump.monitor {
                    m.done();
                }
                info!("Download finished");
                Ok(WaitOutcome::Done)
            }
            Ok(WaitOutcome::Cancelled) => {
                self.discard_partial().await;
                if let Some(m) = &self.pump.monitor {
                    m.done();
                }
                Ok(WaitOutcome::Cancelled)
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "Network down during download");
                Err(DStoreError::Transport(format!("network down: {}", e)))
            }
            Err(e) => Err(e),
        }
    }

    async fn discard_partial(&self) {
        match tokio::fs::remove_file(&self.pump.local_file).await {
            Ok(()) => debug!("Removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Could not remove partial download"),
        }
    }

    /// The failure tag recorded under the status, if the download failed.
    pub fn failure(&self) -> Option<(String, String)> {
        if !self.status.children_of_type(DOWNLOAD_RESULT_SUCCESS_TYPE).is_empty() {
            return None;
        }
        self.status
            .children()
            .into_iter()
            .find(|c| c.kind().ends_with("Exception") || c.kind() == DOWNLOAD_RESULT_UNEXPECTED_ERROR)
            .map(|c| (c.kind(), c.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::DStoreContext;
    use crate::protocol::constants::{DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION, STATUS_TYPE};
    use crate::store::{DataStore, StatusState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingMonitor {
        worked: Mutex<Vec<u64>>,
        messages: Mutex<Vec<String>>,
        cancelled: AtomicBool,
        done: AtomicBool,
    }

    impl ProgressMonitor for RecordingMonitor {
        fn worked(&self, units: u64) {
            self.worked.lock().unwrap().push(units);
        }
        fn sub_task(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
        fn done(&self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn progress_reports_only_strict_increases() {
        let mut progress = DownloadProgress::new(40 * 1024);
        let first = progress.observe(10 * 1024).unwrap();
        assert_eq!(first.percent, 25);
        assert_eq!(first.worked, 10 * 1024);
        assert_eq!(first.message, "10 KB of 40 KB complete (25%)");
        assert!(progress.observe(10 * 1024).is_none());
        assert!(progress.observe(5).is_none());
        let second = progress.observe(40 * 1024).unwrap();
        assert_eq!(second.percent, 100);
        assert_eq!(second.worked, 30 * 1024);
        assert!(DownloadProgress::new(0).observe(1).unwrap().percent == 100);
    }

    #[test]
    fn percentages_never_decrease() {
        let mut progress = DownloadProgress::new(1000);
        let mut last = 0;
        for bytes in [0, 1, 1, 250, 250, 999, 1000] {
            if let Some(report) = progress.observe(bytes) {
                assert!(report.percent >= last);
                last = report.percent;
            }
        }
        assert_eq!(last, 100);
    }

    fn fixture() -> (Arc<DataStore>, Element, tempfile::TempDir) {
        let store = DataStore::new(DStoreContext::new(Arc::new(Config::for_root("/tmp"))), "cli");
        let status = store.create(store.log_root(), STATUS_TYPE, "status", "start").unwrap();
        (store, status, tempfile::tempdir().unwrap())
    }

    #[tokio::test]
    async fn growing_file_is_reported_until_done() {
        let (store, status, dir) = fixture();
        let local = dir.path().join("out.bin");
        let recorder = Arc::new(RecordingMonitor::default());
        let listener = DownloadListener::new(status.clone(), &local, 2048, Some(recorder.clone()));
        let monitor = StatusMonitor::new(store.clone());

        let writer = {
            let store = store.clone();
            let local = local.clone();
            tokio::spawn(async move {
                tokio::fs::write(&local, vec![0u8; 1024]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(250)).await;
                tokio::fs::write(&local, vec![0u8; 2048]).await.unwrap();
                store.create(&status, DOWNLOAD_RESULT_SUCCESS_TYPE, "successful", 2048i64).unwrap();
                store.set_status(&status, StatusState::Done).unwrap();
            })
        };
        let outcome = listener.wait(&monitor).await.unwrap();
        writer.await.unwrap();

        assert_eq!(outcome, WaitOutcome::Done);
        let worked = recorder.worked.lock().unwrap().clone();
        assert_eq!(worked.iter().sum::<u64>(), 2048);
        assert!(worked.iter().all(|w| *w > 0));
        assert!(recorder.done.load(Ordering::SeqCst));
        assert!(listener.failure().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn size_checks_do_not_stall_a_single_threaded_runtime() {
        let (store, status, dir) = fixture();
        let local = dir.path().join("ticks.bin");
        tokio::fs::write(&local, vec![0u8; 512]).await.unwrap();
        let recorder = Arc::new(RecordingMonitor::default());
        let listener = DownloadListener::new(status.clone(), &local, 512, Some(recorder.clone()));
        let monitor = StatusMonitor::new(store.clone());
        let ticker = tokio::spawn(async move {
            let mut ticks = 0u32;
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks += 1;
            }
            store.set_status(&status, StatusState::Done).unwrap();
            ticks
        });
        let outcome = listener.wait(&monitor).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert_eq!(ticker.await.unwrap(), 5);
        assert_eq!(recorder.worked.lock().unwrap().iter().sum::<u64>(), 512);
    }

    #[tokio::test]
    async fn cancelled_download_deletes_the_partial_file() {
        let (store, status, dir) = fixture();
        let local = dir.path().join("partial.bin");
        std::fs::write(&local, b"half").unwrap();
        let recorder = Arc::new(RecordingMonitor::default());
        recorder.cancelled.store(true, Ordering::SeqCst);
        let listener = DownloadListener::new(status, &local, 100, Some(recorder.clone()));

        let outcome = listener.wait(&StatusMonitor::new(store)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(!local.exists());
        assert!(recorder.done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_connection_is_network_down() {
        let (store, status, dir) = fixture();
        let listener = DownloadListener::new(status, dir.path().join("x"), 10, None);
        store.set_connected(false);
        let err = listener.wait(&StatusMonitor::new(store)).await.unwrap_err();
        assert!(err.to_string().contains("network down"));
    }

    #[test]
    fn failure_tag_is_exposed() {
        let (store, status, _dir) = fixture();
        store
            .create(&status, DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION, DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION, "gone")
            .unwrap();
        let listener = DownloadListener::new(status, "/nonexistent", 0, None);
        assert_eq!(
            listener.failure(),
            Some((DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION.to_string(), "gone".to_string()))
        );
    }
}

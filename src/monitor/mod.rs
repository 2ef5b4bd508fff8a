//! Waiting for a command status to settle.

pub mod download;

pub use download::{DownloadListener, DownloadProgress, ProgressMonitor, ProgressReport};

use crate::error::{DStoreError, Result};
use crate::store::{DataStore, Element, StatusState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Work that has to run on the waiting task before each status check.
#[async_trait]
pub trait EventPump: Send + Sync {
    async fn drain(&self);
}

/// Best-effort cancellation of the remote command behind a status.
pub trait RemoteCancel: Send + Sync {
    fn request_cancel(&self, status: &Element);
}

#[derive(Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// No limit means the wait ends only on completion or cancellation.
    pub limit: Option<Duration>,
    /// When set, the wait runs cooperatively and drains the pump first on
    /// every iteration.
    pub pump: Option<Arc<dyn EventPump>>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            limit: None,
            pump: None,
        }
    }
}

impl WaitOptions {
    pub fn with_limit(mut self, limit: Duration) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cooperative(mut self, pump: Arc<dyn EventPump>) -> Self {
        self.pump = Some(pump);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Done,
    Cancelled,
}

enum Check {
    Settled(WaitOutcome),
    Pending,
}

pub struct StatusMonitor {
    store: Arc<DataStore>,
    canceller: Option<Arc<dyn RemoteCancel>>,
}

impl StatusMonitor {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store, canceller: None }
    }

    pub fn with_canceller(mut self, canceller: Arc<dyn RemoteCancel>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    fn check(&self, status: &Element, cancel: &CancellationToken, started: Instant, opts: &WaitOptions) -> Result<Check> {
        // Completion wins over a cancel that raced with it.
        match self.store.status_state(status) {
            StatusState::Done => return Ok(Check::Settled(WaitOutcome::Done)),
            StatusState::Cancelled => return Ok(Check::Settled(WaitOutcome::Cancelled)),
            _ => {}
        }
        if !self.store.is_connected() {
            return Err(DStoreError::Transport("connection lost while waiting".to_string()));
        }
        if cancel.is_cancelled() {
            if let Some(canceller) = &self.canceller {
                canceller.request_cancel(status);
            }
            debug!(status = %status.id(), "Wait cancelled");
            return Ok(Check::Settled(WaitOutcome::Cancelled));
        }
        if let Some(limit) = opts.limit {
            if started.elapsed() >= limit {
                return Err(DStoreError::Timeout(format!("{} still open after {:?}", status.id(), limit)));
            }
        }
        Ok(Check::Pending)
    }

    /// Waits until `status` is done or cancelled, waking on store events and
    /// every poll interval.
    #[instrument(skip(self, status, cancel, opts), fields(status = %status.id()))]
    pub async fn wait_for_update(
        &self,
        status: &Element,
        cancel: &CancellationToken,
        opts: &WaitOptions,
    ) -> Result<WaitOutcome> {
        let mut subscription = self.store.subscribe(status);
        let started = Instant::now();
        loop {
            if let Some(pump) = &opts.pump {
                pump.drain().await;
            }
            if let Check::Settled(outcome) = self.check(status, cancel, started, opts)? {
                return Ok(outcome);
            }
            tokio::select! {
                _ = subscription.recv() => { subscription.drain(); }
                _ = tokio::time::sleep(opts.poll_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// The same wait for callers on a plain thread. Must not be called from
    /// inside a runtime; a pump is driven on a private current-thread one.
    pub fn wait_for_update_blocking(
        &self,
        status: &Element,
        cancel: &CancellationToken,
        opts: &WaitOptions,
    ) -> Result<WaitOutcome> {
        let pump = match &opts.pump {
            Some(pump) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(DStoreError::Io)?;
                Some((runtime, pump))
            }
            None => None,
        };
        let mut subscription = self.store.subscribe(status);
        let started = Instant::now();
        loop {
            if let Some((runtime, pump)) = &pump {
                runtime.block_on(pump.drain());
            }
            if let Check::Settled(outcome) = self.check(status, cancel, started, opts)? {
                return Ok(outcome);
            }
            if subscription.drain() == 0 {
                std::thread::sleep(opts.poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::DStoreContext;
    use crate::protocol::constants::STATUS_TYPE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn store() -> Arc<DataStore> {
        DataStore::new(DStoreContext::new(Arc::new(Config::for_root("/tmp"))), "cli")
    }

    fn status(store: &DataStore) -> Element {
        store.create(store.log_root(), STATUS_TYPE, "status", "start").unwrap()
    }

    #[derive(Default)]
    struct RecordingCancel(Mutex<Vec<String>>);

    impl RemoteCancel for RecordingCancel {
        fn request_cancel(&self, status: &Element) {
            self.0.lock().unwrap().push(status.id().to_string());
        }
    }

    #[derive(Default)]
    struct CountingPump(AtomicUsize);

    #[async_trait]
    impl EventPump for CountingPump {
        async fn drain(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn wakes_when_status_turns_done() {
        let store = store();
        let st = status(&store);
        let monitor = StatusMonitor::new(store.clone());
        let setter = {
            let store = store.clone();
            let st = st.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.set_status(&st, StatusState::Done).unwrap();
            })
        };
        let outcome = monitor
            .wait_for_update(&st, &CancellationToken::new(), &WaitOptions::default())
            .await
            .unwrap();
        setter.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert_eq!(store.notifier().listener_count(), 0);
    }

    #[tokio::test]
    async fn cancel_sends_remote_cancel_and_unregisters() {
        let store = store();
        let st = status(&store);
        let recorder = Arc::new(RecordingCancel::default());
        let monitor = StatusMonitor::new(store.clone()).with_canceller(recorder.clone());
        let token = CancellationToken::new();
        let trip = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.cancel();
        });
        let outcome = monitor.wait_for_update(&st, &token, &WaitOptions::default()).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(*recorder.0.lock().unwrap(), vec![st.id().to_string()]);
        assert_eq!(store.notifier().listener_count(), 0);
    }

    #[tokio::test]
    async fn done_beats_a_late_cancel() {
        let store = store();
        let st = status(&store);
        store.set_status(&st, StatusState::Done).unwrap();
        let recorder = Arc::new(RecordingCancel::default());
        let monitor = StatusMonitor::new(store).with_canceller(recorder.clone());
        let token = CancellationToken::new();
        token.cancel();
        let outcome = monitor.wait_for_update(&st, &token, &WaitOptions::default()).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_and_lost_connection_are_errors() {
        let store = store();
        let st = status(&store);
        let monitor = StatusMonitor::new(store.clone());
        let opts = WaitOptions {
            poll_interval: Duration::from_millis(5),
            ..WaitOptions::default()
        }
        .with_limit(Duration::from_millis(30));
        let err = monitor.wait_for_update(&st, &CancellationToken::new(), &opts).await.unwrap_err();
        assert!(matches!(err, DStoreError::Timeout(_)));

        store.set_connected(false);
        let err = monitor
            .wait_for_update(&st, &CancellationToken::new(), &WaitOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn cooperative_wait_drains_the_pump_each_round() {
        let store = store();
        let st = status(&store);
        let pump = Arc::new(CountingPump::default());
        let monitor = StatusMonitor::new(store.clone());
        let opts = WaitOptions {
            poll_interval: Duration::from_millis(5),
            ..WaitOptions::default()
        }
        .cooperative(pump.clone());
        let setter = {
            let store = store.clone();
            let st = st.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                store.set_status(&st, StatusState::Done).unwrap();
            })
        };
        let outcome = monitor.wait_for_update(&st, &CancellationToken::new(), &opts).await.unwrap();
        setter.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert!(pump.0.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn blocking_regime_waits_on_a_plain_thread() {
        let store = store();
        let st = status(&store);
        let monitor = StatusMonitor::new(store.clone());
        let setter = {
            let store = store.clone();
            let st = st.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                store.set_status(&st, StatusState::Updating).unwrap();
                store.set_status(&st, StatusState::Done).unwrap();
            })
        };
        let outcome = monitor
            .wait_for_update_blocking(&st, &CancellationToken::new(), &WaitOptions::default())
            .unwrap();
        setter.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert_eq!(store.notifier().listener_count(), 0);
    }

    #[test]
    fn blocking_regime_drives_an_async_pump() {
        let store = store();
        let st = status(&store);
        let pump = Arc::new(CountingPump::default());
        let monitor = StatusMonitor::new(store.clone());
        let opts = WaitOptions {
            poll_interval: Duration::from_millis(5),
            ..WaitOptions::default()
        }
        .cooperative(pump.clone());
        let setter = {
            let store = store.clone();
            let st = st.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                store.set_status(&st, StatusState::Done).unwrap();
            })
        };
        let outcome = monitor.wait_for_update_blocking(&st, &CancellationToken::new(), &opts).unwrap();
        setter.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Done);
        assert!(pump.0.load(Ordering::SeqCst) >= 2);
    }
}

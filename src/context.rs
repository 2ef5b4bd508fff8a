//! Per-connection context replacing process-wide statics.

use crate::config::Config;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Element lifecycle totals kept for diagnostics.
#[derive(Debug, Default)]
pub struct Counters {
    created: AtomicU64,
    disconnected: AtomicU64,
    reclaimed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub created: u64,
    pub disconnected: u64,
    pub reclaimed: u64,
}

impl Counters {
    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            created: self.created.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Created once when a connection is established, torn down with it.
#[derive(Debug)]
pub struct DStoreContext {
    config: Arc<Config>,
    counters: Arc<Counters>,
    spirit: AtomicBool,
    shutdown: CancellationToken,
    connection_id: String,
}

impl DStoreContext {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let spirit = AtomicBool::new(config.spirit_on);
        Arc::new(Self {
            config,
            counters: Arc::new(Counters::default()),
            spirit,
            shutdown: CancellationToken::new(),
            connection_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn spirit_enabled(&self) -> bool {
        self.spirit.load(Ordering::SeqCst)
    }

    pub fn set_spirit_enabled(&self, enabled: bool) {
        self.spirit.store(enabled, Ordering::SeqCst);
    }

    /// Cancelled when the connection is torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn teardown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_torn_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

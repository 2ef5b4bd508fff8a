//! Expiry queue that turns unused elements into spirits.

use crate::dispatcher::scheduler::Handler;
use crate::store::element::Element;
use crate::store::DataStore;
use crate::utils::mem_logger::MemLogger;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Elements turned into spirits.
    pub evicted: usize,
    /// Entries discarded without marking (spirit mode off, or already gone).
    pub drained: usize,
    /// Entries left in the queue.
    pub remaining: usize,
}

struct QueueItem {
    element: Element,
    queued_at: Instant,
}

pub struct ElementRemover {
    store: Arc<DataStore>,
    queue: Mutex<VecDeque<QueueItem>>,
    expiry: Duration,
    interval: Duration,
    mem_log: Option<MemLogger>,
}

impl ElementRemover {
    /// Uses the spirit timings from the connection's configuration.
    pub fn new(store: Arc<DataStore>) -> Self {
        let config = store.context().config().clone();
        let mut remover = Self::with_timings(store, config.spirit_expiry, config.spirit_interval);
        remover.mem_log = MemLogger::from_config(&config);
        remover
    }

    pub fn with_timings(store: Arc<DataStore>, expiry: Duration, interval: Duration) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            expiry,
            interval,
            mem_log: None,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Queues `element` for removal. Returns false when spirit mode is off
    /// or the element is not part of the live store.
    pub fn enqueue(&self, element: &Element) -> bool {
        self.enqueue_at(element, Instant::now())
    }

    pub fn enqueue_at(&self, element: &Element, queued_at: Instant) -> bool {
        if !self.store.context().spirit_enabled() || !self.store.is_connected() || !self.store.owns(element) {
            return false;
        }
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        // Keep the queue time ordered even if callers pass older stamps.
        let position = queue
            .iter()
            .rposition(|item| item.queued_at <= queued_at)
            .map_or(0, |p| p + 1);
        queue.insert(
            position,
            QueueItem {
                element: element.clone(),
                queued_at,
            },
        );
        true
    }

    /// Takes `element` back out of the queue because it is in use again.
    pub fn rescue(&self, element: &Element) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let before = queue.len();
        queue.retain(|item| !item.element.ptr_eq(element));
        queue.len() != before
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Evicts queue heads older than the expiry window, oldest first,
    /// stopping at the first entry still inside the window.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.store.context().spirit_enabled() {
            report.drained = queue.len();
            queue.clear();
            return report;
        }

        while let Some(head) = queue.front() {
            if now.saturating_duration_since(head.queued_at) <= self.expiry {
                break;
            }
            let Some(item) = queue.pop_front() else { break };
            if self.store.disconnect(&item.element) {
                report.evicted += 1;
            } else {
                report.drained += 1;
            }
        }
        report.remaining = queue.len();
        report
    }
}

#[async_trait]
impl Handler for ElementRemover {
    fn name(&self) -> &str {
        "element-remover"
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    #[instrument(skip(self), fields(connection = %self.store.context().connection_id()))]
    async fn tick(&self) {
        let report = self.sweep();
        if report.evicted > 0 || report.drained > 0 {
            debug!(?report, "Sweep finished");
        }
        if let Some(mem_log) = &self.mem_log {
            let totals = self.store.context().counters().snapshot();
            mem_log
                .log_sweep(self.store.context().connection_id(), &report, &totals)
                .await;
        }
    }
}

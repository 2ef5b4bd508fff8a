use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// A unit of work driven by the [`Scheduler`] loop.
///
/// `tick` runs on the loop itself and must return quickly. Anything that
/// blocks belongs on its own task, publishing results into the store.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Period between ticks. `None` means the handler only runs when the
    /// scheduler is woken.
    fn interval(&self) -> Option<Duration>;

    async fn tick(&self);
}

/// Wakes the scheduler so on-demand handlers run on the next turn.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

struct Entry {
    handler: Arc<dyn Handler>,
    next_due: Option<Instant>,
}

/// One cooperative loop per side of a connection.
pub struct Scheduler {
    entries: Vec<Entry>,
    handle: SchedulerHandle,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: Vec::new(),
            handle: SchedulerHandle::default(),
            shutdown,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let next_due = handler.interval().map(|every| Instant::now() + every);
        debug!(handler = handler.name(), ?next_due, "Registered handler");
        self.entries.push(Entry { handler, next_due });
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(handlers = self.entries.len()))]
    pub async fn run(mut self) {
        info!("Scheduler loop started");
        loop {
            let earliest = self.entries.iter().filter_map(|e| e.next_due).min();
            let woken = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.handle.wake.notified() => true,
                _ = sleep_until_opt(earliest) => false,
            };

            let now = Instant::now();
            for entry in &mut self.entries {
                let due = entry.next_due.map_or(false, |at| at <= now);
                let on_demand = woken && entry.next_due.is_none();
                if !due && !on_demand {
                    continue;
                }
                entry.handler.tick().await;
                if let Some(every) = entry.handler.interval() {
                    entry.next_due = Some(Instant::now() + every);
                }
            }
        }
        info!("Scheduler loop stopped");
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

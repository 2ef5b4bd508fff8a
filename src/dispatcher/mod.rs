//! Routes command invocations to miners.
//!
//! Every invocation gets a status element before anything else happens, so a
//! waiting client always has something that eventually turns terminal.

pub mod scheduler;

use crate::error::{DStoreError, Result};
use crate::protocol::constants::{CommandName, COMMAND_TYPE, ERROR_TYPE, MINER_TYPE, STATUS_TYPE};
use crate::protocol::envelope::CommandRequest;
use crate::store::{DataStore, Element, ElementId, ElementRemover, ElementSnapshot, ElementValue, StatusState};
use async_trait::async_trait;
use scheduler::{Handler, Scheduler, SchedulerHandle};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, instrument, warn};

type ActiveMap = Mutex<HashMap<ElementId, CancellationToken>>;

/// A family of remote operations.
pub trait Miner: Send + Sync {
    fn id(&self) -> &'static str;

    fn commands(&self) -> &'static [CommandName];

    /// Called once, the first time a client asks for the miner.
    fn activate(&self, _store: &Arc<DataStore>, _handle: &MinerHandle) -> Result<()> {
        Ok(())
    }

    /// Runs on the scheduler loop and must not block. Long work moves the
    /// invocation into a spawned task.
    fn handle(&self, invocation: Invocation);
}

/// A registered miner and the element that represents it in the store.
#[derive(Debug, Clone)]
pub struct MinerHandle {
    id: String,
    element: Element,
}

impl MinerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn element(&self) -> &Element {
        &self.element
    }
}

/// One command being executed.
///
/// Dropping the invocation finishes it: a status that is still open at that
/// point is moved to done.
pub struct Invocation {
    command: CommandName,
    store: Arc<DataStore>,
    command_element: Element,
    status: Element,
    subject: Element,
    args: Vec<Element>,
    miner: Element,
    cancel: CancellationToken,
    active: Weak<ActiveMap>,
    retire: Option<Arc<ElementRemover>>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command)
            .field("status", self.status.id())
            .field("subject", self.subject.id())
            .field("args", &self.args.len())
            .finish()
    }
}

impl Invocation {
    pub fn command(&self) -> CommandName {
        self.command
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn command_element(&self) -> &Element {
        &self.command_element
    }

    pub fn status(&self) -> &Element {
        &self.status
    }

    pub fn subject(&self) -> &Element {
        &self.subject
    }

    pub fn args(&self) -> &[Element] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Element> {
        self.args.get(index)
    }

    /// Value of the argument at `index`, if present.
    pub fn arg_value(&self, index: usize) -> Option<String> {
        self.args.get(index).map(|a| a.value())
    }

    pub fn miner_element(&self) -> &Element {
        &self.miner
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Adds a result element below the status.
    pub fn add_result(&self, kind: &str, name: &str, value: impl Into<ElementValue>) -> Result<Element> {
        self.store.create(&self.status, kind, name, value)
    }

    pub fn report_error(&self, err: &DStoreError) -> Result<Element> {
        record_error(&self.store, &self.status, err)
    }

    pub fn update(&self) -> Result<bool> {
        self.store.set_status(&self.status, StatusState::Updating)
    }

    pub fn done(&self) -> Result<bool> {
        self.store.set_status(&self.status, StatusState::Done)
    }

    pub fn mark_cancelled(&self) -> Result<bool> {
        self.store.set_status(&self.status, StatusState::Cancelled)
    }

    /// Reports `err` and closes the status.
    pub fn fail(&self, err: &DStoreError) -> Result<bool> {
        if err.is_cancelled() {
            return self.mark_cancelled();
        }
        self.report_error(err)?;
        self.done()
    }

    /// Closes the status according to `result`.
    pub fn finish(self, result: Result<()>) {
        let outcome = match &result {
            Ok(()) => self.done(),
            Err(e) => {
                debug!(command = %self.command, error = %e, "Command failed");
                self.fail(e)
            }
        };
        if let Err(e) = outcome {
            debug!(command = %self.command, error = %e, "Could not close status");
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if let Some(active) = self.active.upgrade() {
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.status.id());
        }
        if self.store.is_connected() && !self.store.status_state(&self.status).is_terminal() {
            let _ = self.store.set_status(&self.status, StatusState::Done);
        }
        if let Some(remover) = &self.retire {
            retire(remover, &self.store, &self.command_element, &self.subject);
        }
    }
}

/// Queues a finished command together with a subject that only exists as
/// scratch for it.
fn retire(remover: &ElementRemover, store: &DataStore, command_element: &Element, subject: &Element) {
    remover.enqueue(command_element);
    if subject.parent().is_some_and(|p| p.ptr_eq(store.temp_root())) {
        remover.enqueue(subject);
    }
}

pub(crate) fn error_kind(err: &DStoreError) -> &'static str {
    match err {
        DStoreError::Transport(_) => "TransportError",
        DStoreError::Protocol(_) => "ProtocolError",
        DStoreError::RemoteExecution(_) => "RemoteExecutionError",
        DStoreError::StaleElement(_) => "StaleElementError",
        DStoreError::UnknownCommand(_) => "UnknownCommandError",
        DStoreError::Cancelled(_) => "CancelledError",
        DStoreError::Timeout(_) => "TimeoutError",
        DStoreError::Io(_) => "IOException",
        DStoreError::InvalidArgument(_) => "InvalidArgumentError",
        DStoreError::Config(_) => "ConfigError",
        DStoreError::Json(_) => "JsonError",
    }
}

fn record_error(store: &DataStore, status: &Element, err: &DStoreError) -> Result<Element> {
    store.create(status, ERROR_TYPE, error_kind(err), err.to_string())
}

struct RegisteredMiner {
    miner: Arc<dyn Miner>,
    handle: MinerHandle,
    activated: AtomicBool,
}

pub struct CommandDispatcher {
    store: Arc<DataStore>,
    miners: RwLock<HashMap<String, RegisteredMiner>>,
    routes: RwLock<HashMap<CommandName, String>>,
    pending: Mutex<VecDeque<Invocation>>,
    active: Arc<ActiveMap>,
    waker: Mutex<Option<SchedulerHandle>>,
    retire: Mutex<Option<Arc<ElementRemover>>>,
}

impl CommandDispatcher {
    pub fn new(store: Arc<DataStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            miners: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            waker: Mutex::new(None),
            retire: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Lets the scheduler loop drive queued invocations.
    pub fn attach(self: &Arc<Self>, scheduler: &mut Scheduler) {
        *self.waker.lock().unwrap_or_else(PoisonError::into_inner) = Some(scheduler.handle());
        scheduler.register(self.clone());
    }

    /// Finished command elements are queued on `remover` and become spirits
    /// once they expire.
    pub fn retire_into(&self, remover: Arc<ElementRemover>) {
        *self.retire.lock().unwrap_or_else(PoisonError::into_inner) = Some(remover);
    }

    #[instrument(skip(self, miner), fields(miner = miner.id()))]
    pub fn register_miner(&self, miner: Arc<dyn Miner>) -> Result<MinerHandle> {
        let id = miner.id().to_string();
        let mut miners = self.miners.write().unwrap_or_else(PoisonError::into_inner);
        if miners.contains_key(&id) {
            return Err(DStoreError::InvalidArgument(format!("miner {} is already registered", id)));
        }
        let element = self.store.create(self.store.miner_root(), MINER_TYPE, &id, "")?;
        let handle = MinerHandle {
            id: id.clone(),
            element,
        };
        {
            let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
            for command in miner.commands() {
                if let Some(previous) = routes.insert(*command, id.clone()) {
                    warn!(command = %command, previous = %previous, "Command rerouted to another miner");
                }
            }
        }
        miners.insert(
            id.clone(),
            RegisteredMiner {
                miner,
                handle: handle.clone(),
                activated: AtomicBool::new(false),
            },
        );
        info!(miner = %id, "Registered miner");
        Ok(handle)
    }

    pub fn miner(&self, id: &str) -> Option<MinerHandle> {
        self.miners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|m| m.handle.clone())
    }

    /// Activates the miner once; later calls are no-ops.
    #[instrument(skip(self))]
    pub fn activate_miner(&self, id: &str) -> Result<MinerHandle> {
        let (miner, handle) = {
            let miners = self.miners.read().unwrap_or_else(PoisonError::into_inner);
            let registered = miners
                .get(id)
                .ok_or_else(|| DStoreError::InvalidArgument(format!("no miner named {}", id)))?;
            if registered.activated.swap(true, Ordering::SeqCst) {
                return Ok(registered.handle.clone());
            }
            (registered.miner.clone(), registered.handle.clone())
        };
        miner.activate(&self.store, &handle)?;
        info!(miner = %id, "Activated miner");
        Ok(handle)
    }

    /// Activates a miner for a client and closes the status the client
    /// allocated for the request. A failed activation is recorded under the
    /// status rather than returned.
    #[instrument(skip(self, status), fields(status = %status.id))]
    pub fn activate_remote(&self, miner: &str, status: &ElementSnapshot) -> Result<Element> {
        let mut snapshot = status.clone();
        snapshot.kind = STATUS_TYPE.to_string();
        let status = self.store.materialize(self.store.log_root(), &snapshot)?;
        match self.activate_miner(miner) {
            Ok(_) => {
                self.store.set_status(&status, StatusState::Done)?;
            }
            Err(e) => {
                warn!(miner = %miner, error = %e, "Miner activation failed");
                self.close_with_error(&status, &e);
            }
        }
        if let Some(remover) = self.retire.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            remover.enqueue(&status);
        }
        Ok(status)
    }

    /// Starts `command` against `subject` on this side and returns its status.
    #[instrument(skip(self, subject, args), fields(subject = %subject.id()))]
    pub fn handle(&self, command: &str, subject: &Element, args: &[Element]) -> Result<Element> {
        let command_element = self
            .store
            .create(self.store.log_root(), COMMAND_TYPE, command, subject.id().as_str())?;
        let status = self.store.create_status(&command_element)?;
        self.enqueue(command, command_element, status.clone(), subject.clone(), args.to_vec());
        Ok(status)
    }

    /// Starts a command sent by a client, reusing the element ids it chose.
    #[instrument(skip(self, request), fields(command = %request.command.name))]
    pub fn submit(&self, request: CommandRequest) -> Result<Element> {
        let command_element = self.store.materialize(self.store.log_root(), &request.command)?;
        let mut status_snapshot = request.status.clone();
        status_snapshot.kind = STATUS_TYPE.to_string();
        let status = self.store.materialize(&command_element, &status_snapshot)?;
        let subject = self.resolve(self.store.temp_root(), &request.subject)?;
        let args = request
            .args
            .iter()
            .map(|arg| self.resolve(&command_element, arg))
            .collect::<Result<Vec<_>>>()?;
        self.enqueue(&request.command.name, command_element, status.clone(), subject, args);
        Ok(status)
    }

    /// Existing elements are used as they are; unknown ones are created.
    fn resolve(&self, parent: &Element, snapshot: &ElementSnapshot) -> Result<Element> {
        match self.store.find_by_id(&snapshot.id) {
            Some(existing) => Ok(existing),
            None => self.store.materialize(parent, snapshot),
        }
    }

    fn enqueue(&self, name: &str, command_element: Element, status: Element, subject: Element, args: Vec<Element>) {
        let checked = name.parse::<CommandName>().and_then(|command| {
            let arity = command.arity();
            if !arity.accepts(args.len()) {
                return Err(DStoreError::InvalidArgument(format!(
                    "{} expects {} arguments, got {}",
                    command,
                    arity,
                    args.len()
                )));
            }
            Ok(command)
        });
        let command = match checked {
            Ok(command) => command,
            Err(e) => {
                warn!(command = %name, error = %e, "Rejecting command");
                self.close_with_error(&status, &e);
                self.retire_now(&command_element, &subject);
                return;
            }
        };

        if command == CommandName::Cancel {
            self.cancel(&subject);
            if let Err(e) = self.store.set_status(&status, StatusState::Done) {
                debug!(error = %e, "Could not close cancel status");
            }
            self.retire_now(&command_element, &subject);
            return;
        }

        let miner = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            routes.get(&command).cloned()
        };
        let Some(miner_id) = miner else {
            let e = DStoreError::UnknownCommand(format!("no miner handles {}", command));
            warn!(command = %command, "No miner registered for command");
            self.close_with_error(&status, &e);
            self.retire_now(&command_element, &subject);
            return;
        };
        let Some(miner) = self.miner(&miner_id) else {
            self.close_with_error(&status, &DStoreError::UnknownCommand(command.to_string()));
            self.retire_now(&command_element, &subject);
            return;
        };

        let cancel = self.store.context().shutdown_token().child_token();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.id().clone(), cancel.clone());
        let invocation = Invocation {
            command,
            store: self.store.clone(),
            command_element,
            status,
            subject,
            args,
            miner: miner.element().clone(),
            cancel,
            active: Arc::downgrade(&self.active),
            retire: self.retire.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        };
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(invocation);
        if let Some(waker) = self.waker.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            waker.wake();
        }
    }

    fn retire_now(&self, command_element: &Element, subject: &Element) {
        if let Some(remover) = self.retire.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            retire(remover, &self.store, command_element, subject);
        }
    }

    fn close_with_error(&self, status: &Element, err: &DStoreError) {
        let closed = record_error(&self.store, status, err).and_then(|_| self.store.set_status(status, StatusState::Done));
        if let Err(e) = closed {
            debug!(error = %e, "Could not close rejected command");
        }
    }

    /// Cancels the command owning `target` (its status or its command
    /// element). Returns true if this call decided the outcome.
    pub fn cancel(&self, target: &Element) -> bool {
        let status = if target.kind() == STATUS_TYPE {
            target.clone()
        } else {
            match target.children_of_type(STATUS_TYPE).into_iter().next() {
                Some(status) => status,
                None => {
                    debug!(target = %target.id(), "Cancel target has no status");
                    return false;
                }
            }
        };
        if let Some(token) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(status.id())
        {
            token.cancel();
        }
        match self.store.set_status(&status, StatusState::Cancelled) {
            Ok(decided) => {
                debug!(status = %status.id(), decided, "Cancel requested");
                decided
            }
            Err(e) => {
                debug!(status = %status.id(), error = %e, "Cancel on stale status");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Hands every queued invocation to its miner.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(invocation) = next else { break };
            if self.store.status_state(invocation.status()).is_terminal() {
                continue;
            }
            let miner = {
                let miners = self.miners.read().unwrap_or_else(PoisonError::into_inner);
                let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
                routes
                    .get(&invocation.command)
                    .and_then(|id| miners.get(id))
                    .map(|m| m.miner.clone())
            };
            match miner {
                Some(miner) => {
                    if let Err(e) = invocation.update() {
                        debug!(error = %e, "Could not mark command as updating");
                    }
                    miner.handle(invocation);
                    ran += 1;
                }
                None => {
                    let e = DStoreError::UnknownCommand(invocation.command.to_string());
                    let _ = invocation.fail(&e);
                }
            }
        }
        ran
    }
}

#[async_trait]
impl Handler for CommandDispatcher {
    fn name(&self) -> &str {
        "command-dispatcher"
    }

    fn interval(&self) -> Option<Duration> {
        None
    }

    async fn tick(&self) {
        let ran = self.run_pending();
        if ran > 0 {
            debug!(ran, "Dispatched commands");
        }
    }
}

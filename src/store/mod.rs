//! The shared element store.
//!
//! One `DataStore` lives on each side of a connection. The server store is
//! authoritative; every mutation on it is published as a [`Delta`] to the
//! mirror sink, and the client store applies those deltas with
//! [`DataStore::apply`].

pub mod delta;
pub mod element;
pub mod notifier;
pub mod remover;
pub mod status;

pub use delta::{delta_channel, Delta, DeltaReceiver, DeltaSender};
pub use element::{Attribute, Element, ElementId, ElementSnapshot, ElementValue};
pub use notifier::{DomainEvent, DomainEventKind, DomainNotifier, Subscription};
pub use remover::{ElementRemover, SweepReport};
pub use status::StatusState;

use crate::context::DStoreContext;
use crate::error::{DStoreError, Result};
use crate::protocol::constants::STATUS_TYPE;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

pub const ROOT_ID: &str = "root";
pub const HOST_ROOT_ID: &str = "root.host";
pub const LOG_ROOT_ID: &str = "root.log";
pub const MINER_ROOT_ID: &str = "root.miners";
pub const TEMP_ROOT_ID: &str = "root.temp";

struct StoreInner {
    index: HashMap<ElementId, Element>,
    next_seq: u64,
}

pub struct DataStore {
    uid: Uuid,
    space: String,
    ctx: Arc<DStoreContext>,
    /// Serialization point for every structural edit.
    inner: Mutex<StoreInner>,
    connected: AtomicBool,
    notifier: Arc<DomainNotifier>,
    mirror: Mutex<Option<DeltaSender>>,
    root: Element,
    host_root: Element,
    log_root: Element,
    miner_root: Element,
    temp_root: Element,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("space", &self.space)
            .field("connected", &self.is_connected())
            .field("elements", &self.len())
            .finish()
    }
}

impl DataStore {
    pub fn new(ctx: Arc<DStoreContext>, space: impl Into<String>) -> Arc<Self> {
        let uid = Uuid::new_v4();
        let space = space.into();
        let counters = ctx.counters().clone();
        let root = Element::new_node(ElementId::well_known(ROOT_ID), uid, counters.clone(), "root", &space, "", None);
        let make_root = |id: &str, name: &str| {
            let el = Element::new_node(ElementId::well_known(id), uid, counters.clone(), "root", name, "", Some(&root));
            root.write().children.push(el.clone());
            el
        };
        let host_root = make_root(HOST_ROOT_ID, "host");
        let log_root = make_root(LOG_ROOT_ID, "log");
        let miner_root = make_root(MINER_ROOT_ID, "miners");
        let temp_root = make_root(TEMP_ROOT_ID, "temp");

        let mut index = HashMap::new();
        for el in [&root, &host_root, &log_root, &miner_root, &temp_root] {
            index.insert(el.id().clone(), el.clone());
        }

        Arc::new(Self {
            uid,
            space,
            ctx,
            inner: Mutex::new(StoreInner { index, next_seq: 1 }),
            connected: AtomicBool::new(true),
            notifier: DomainNotifier::new(),
            mirror: Mutex::new(None),
            root,
            host_root,
            log_root,
            miner_root,
            temp_root,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn context(&self) -> &Arc<DStoreContext> {
        &self.ctx
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn host_root(&self) -> &Element {
        &self.host_root
    }

    pub fn log_root(&self) -> &Element {
        &self.log_root
    }

    pub fn miner_root(&self) -> &Element {
        &self.miner_root
    }

    pub fn temp_root(&self) -> &Element {
        &self.temp_root
    }

    pub fn notifier(&self) -> &Arc<DomainNotifier> {
        &self.notifier
    }

    pub fn subscribe(&self, element: &Element) -> Subscription {
        self.notifier.subscribe(element.id().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Marks the store as torn down; every later mutation fails as stale.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Routes every subsequent mutation to `sink`.
    pub fn set_mirror(&self, sink: DeltaSender) {
        *self.mirror.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn clear_mirror(&self) {
        *self.mirror.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of elements reachable through the id index.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `element` belongs to this (live) store.
    pub fn owns(&self, element: &Element) -> bool {
        element.0.owner == self.uid && !element.is_removed()
    }

    pub fn ensure_live(&self, element: &Element) -> Result<()> {
        if !self.is_connected() {
            return Err(DStoreError::StaleElement(format!(
                "{}: connection {} has been torn down",
                element.id(),
                self.space
            )));
        }
        if element.0.owner != self.uid {
            return Err(DStoreError::StaleElement(format!("{} belongs to another store", element.id())));
        }
        let state = element.read();
        if state.removed || state.spirit {
            return Err(DStoreError::StaleElement(format!("{} has been disconnected", element.id())));
        }
        Ok(())
    }

    fn publish(&self, delta: Delta, event: DomainEvent) {
        trace!(space = %self.space, element = %delta.element_id(), "Publishing delta");
        if let Some(sink) = self.mirror.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if sink.send(delta).is_err() {
                debug!(space = %self.space, "Mirror sink closed");
            }
        }
        self.notifier.notify(event);
    }

    fn attach(&self, inner: &mut StoreInner, parent: &Element, element: Element) {
        {
            let mut parent_state = parent.write();
            parent_state.children.push(element.clone());
            parent_state.touched = Instant::now();
        }
        inner.index.insert(element.id().clone(), element.clone());
        let snapshot = element.snapshot();
        self.publish(
            Delta::Created {
                parent: parent.id().clone(),
                element: snapshot,
            },
            DomainEvent {
                element: element.id().clone(),
                parent: Some(parent.id().clone()),
                kind: DomainEventKind::Created,
            },
        );
    }

    /// Creates a new child of `parent`.
    pub fn create(
        &self,
        parent: &Element,
        kind: &str,
        name: &str,
        value: impl Into<ElementValue>,
    ) -> Result<Element> {
        let mut inner = self.lock();
        self.ensure_live(parent)?;
        let id = ElementId::new(&self.space, inner.next_seq);
        inner.next_seq += 1;
        let element = Element::new_node(
            id,
            self.uid,
            self.ctx.counters().clone(),
            kind,
            name,
            &value.into().to_wire(),
            Some(parent),
        );
        self.attach(&mut inner, parent, element.clone());
        Ok(element)
    }

    /// Creates `snapshot` under `parent` keeping its id. If the id is already
    /// indexed the existing element is updated instead.
    pub fn materialize(&self, parent: &Element, snapshot: &ElementSnapshot) -> Result<Element> {
        self.ensure_live(parent)?;
        if let Some(existing) = self.find_by_id(&snapshot.id) {
            self.overwrite(&existing, snapshot)?;
            return Ok(existing);
        }
        let mut inner = self.lock();
        self.ensure_live(parent)?;
        let element = Element::new_node(
            snapshot.id.clone(),
            self.uid,
            self.ctx.counters().clone(),
            &snapshot.kind,
            &snapshot.name,
            &snapshot.value,
            Some(parent),
        );
        element.write().source = snapshot.source.clone();
        self.attach(&mut inner, parent, element.clone());
        Ok(element)
    }

    fn overwrite(&self, element: &Element, snapshot: &ElementSnapshot) -> Result<()> {
        let _inner = self.lock();
        self.ensure_live(element)?;
        {
            let mut state = element.write();
            state.kind = snapshot.kind.clone();
            state.name = snapshot.name.clone();
            state.value = snapshot.value.clone();
            state.source = snapshot.source.clone();
            state.touched = Instant::now();
        }
        self.publish_update(element);
        Ok(())
    }

    fn publish_update(&self, element: &Element) {
        self.publish(
            Delta::Updated {
                element: element.snapshot(),
            },
            DomainEvent {
                element: element.id().clone(),
                parent: element.parent().map(|p| p.id().clone()),
                kind: DomainEventKind::Updated,
            },
        );
    }

    pub fn find_by_id(&self, id: &ElementId) -> Option<Element> {
        self.lock().index.get(id).cloned()
    }

    /// Breadth-first search below `root` for an element whose `attribute`
    /// equals `value`, looking at most `depth` levels down (1 = children).
    pub fn find(&self, root: &Element, attribute: Attribute, value: &str, depth: usize) -> Option<Element> {
        let mut queue: VecDeque<(Element, usize)> = VecDeque::new();
        queue.push_back((root.clone(), 0));
        while let Some((current, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            for child in current.children() {
                if child.is_spirit() || child.is_removed() {
                    continue;
                }
                if child.attribute(attribute) == value {
                    return Some(child);
                }
                queue.push_back((child, level + 1));
            }
        }
        None
    }

    pub fn set_attribute(&self, element: &Element, attribute: Attribute, value: impl Into<ElementValue>) -> Result<()> {
        let value = value.into().to_wire();
        let _inner = self.lock();
        self.ensure_live(element)?;
        {
            let mut state = element.write();
            match attribute {
                Attribute::Id => {
                    return Err(DStoreError::InvalidArgument("element ids are immutable".to_string()));
                }
                Attribute::Type => state.kind = value,
                Attribute::Name => state.name = value,
                Attribute::Value => state.value = value,
                Attribute::Source => state.source = value,
            }
            state.touched = Instant::now();
        }
        self.publish_update(element);
        Ok(())
    }

    /// Re-publishes the current state of `element`.
    pub fn refresh(&self, element: &Element) -> Result<()> {
        let _inner = self.lock();
        self.ensure_live(element)?;
        element.write().touched = Instant::now();
        self.publish_update(element);
        Ok(())
    }

    pub fn create_status(&self, command: &Element) -> Result<Element> {
        let pending = StatusState::Pending.as_str();
        self.create(command, STATUS_TYPE, pending, pending)
    }

    pub fn status_state(&self, status: &Element) -> StatusState {
        StatusState::parse(&status.name()).unwrap_or(StatusState::Pending)
    }

    /// Moves `status` forward to `next`. Returns `false` without touching
    /// anything when that would not be a forward step, so racing writers
    /// agree on a single terminal state.
    pub fn set_status(&self, status: &Element, next: StatusState) -> Result<bool> {
        let _inner = self.lock();
        self.ensure_live(status)?;
        {
            let mut state = status.write();
            let current = StatusState::parse(&state.name).unwrap_or(StatusState::Pending);
            if !current.can_advance_to(next) {
                return Ok(false);
            }
            state.name = next.as_str().to_string();
            state.value = next.as_str().to_string();
            state.touched = Instant::now();
        }
        self.publish_update(status);
        Ok(true)
    }

    /// Detaches `element` and its subtree from the store.
    pub fn remove(&self, element: &Element) -> Result<()> {
        let mut inner = self.lock();
        self.ensure_live(element)?;
        let parent = element
            .parent()
            .ok_or_else(|| DStoreError::InvalidArgument(format!("{} is a root", element.id())))?;
        self.detach(&mut inner, &parent, element);
        Ok(())
    }

    fn detach(&self, inner: &mut StoreInner, parent: &Element, element: &Element) {
        {
            let mut parent_state = parent.write();
            parent_state.children.retain(|c| !c.ptr_eq(element));
            parent_state.touched = Instant::now();
        }
        mark_removed(inner, element);
        self.publish(
            Delta::Removed {
                parent: parent.id().clone(),
                id: element.id().clone(),
            },
            DomainEvent {
                element: element.id().clone(),
                parent: Some(parent.id().clone()),
                kind: DomainEventKind::Removed,
            },
        );
    }

    /// Removes every child of `element`, returning how many were dropped.
    pub fn remove_children(&self, element: &Element) -> Result<usize> {
        let mut inner = self.lock();
        self.ensure_live(element)?;
        let children = element.children();
        for child in &children {
            self.detach(&mut inner, element, child);
        }
        Ok(children.len())
    }

    /// Marks `element` and everything below it as spirits, unlinks it from
    /// its parent and drops the whole subtree from the id index. The nodes
    /// are freed once the last handle goes away. Returns true if the element
    /// was not a spirit before.
    pub(crate) fn disconnect(&self, element: &Element) -> bool {
        if element.0.owner != self.uid {
            return false;
        }
        let mut inner = self.lock();
        let newly = {
            let mut state = element.write();
            if state.spirit || state.removed {
                false
            } else {
                state.spirit = true;
                state.touched = Instant::now();
                true
            }
        };
        if !newly {
            inner.index.remove(element.id());
            return false;
        }
        self.ctx.counters().record_disconnected();
        self.publish_update(element);
        if let Some(parent) = element.parent() {
            parent.write().children.retain(|c| !c.ptr_eq(element));
        }
        element.write().parent = Weak::new();
        inner.index.remove(element.id());

        for descendant in self.subtree(element).into_iter().skip(1) {
            inner.index.remove(descendant.id());
            let marked = {
                let mut state = descendant.write();
                let fresh = !state.spirit && !state.removed;
                state.spirit = true;
                fresh
            };
            if marked {
                self.ctx.counters().record_disconnected();
                self.publish_update(&descendant);
            }
        }
        true
    }

    /// Applies a delta received from the authoritative side.
    pub fn apply(&self, delta: Delta) -> Result<()> {
        match delta {
            Delta::Created { parent, element } => match self.find_by_id(&parent) {
                Some(parent) => self.materialize(&parent, &element).map(|_| ()),
                None => {
                    trace!(parent = %parent, element = %element.id, "Ignoring delta for unknown parent");
                    Ok(())
                }
            },
            Delta::Updated { element } => {
                let Some(local) = self.find_by_id(&element.id) else {
                    return Ok(());
                };
                if element.spirit {
                    // Spirits are dropped from the replica; handles held
                    // elsewhere keep them alive until released.
                    local.write().spirit = true;
                    let mut inner = self.lock();
                    match local.parent() {
                        Some(parent) => self.detach(&mut inner, &parent, &local),
                        None => mark_removed(&mut inner, &local),
                    }
                    Ok(())
                } else {
                    self.overwrite(&local, &element)
                }
            }
            Delta::Removed { id, .. } => match self.find_by_id(&id) {
                Some(local) => self.remove(&local),
                None => Ok(()),
            },
            // File content is written by the connection, not the store.
            Delta::Transfer { .. } => Ok(()),
        }
    }

    /// Sends a file chunk to the peer, ordered with the element deltas.
    /// Waits while the peer is still behind on earlier chunks.
    pub async fn transfer(&self, status: &Element, destination: &str, offset: u64, data: Vec<u8>) -> Result<()> {
        self.ensure_live(status)?;
        let sink = self
            .mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DStoreError::Transport("no peer attached to receive the file".to_string()))?;
        sink.send_transfer(Delta::Transfer {
            status: status.id().clone(),
            destination: destination.to_string(),
            offset,
            data,
        })
        .await
        .map_err(|_| DStoreError::Transport("peer is gone".to_string()))
    }

    /// Creation deltas that rebuild everything below `root` on a replica,
    /// parents before children.
    pub fn snapshot_deltas(&self, root: &Element) -> Vec<Delta> {
        self.subtree(root)
            .into_iter()
            .skip(1)
            .filter(|el| !el.is_spirit() && !el.is_removed())
            .filter_map(|el| {
                let parent = el.parent()?;
                Some(Delta::Created {
                    parent: parent.id().clone(),
                    element: el.snapshot(),
                })
            })
            .collect()
    }

    /// Elements below `root`, depth first, including `root`.
    pub fn subtree(&self, root: &Element) -> Vec<Element> {
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(el) = stack.pop() {
            let children = el.children();
            out.push(el);
            stack.extend(children.into_iter().rev());
        }
        out
    }
}

fn mark_removed(inner: &mut StoreInner, element: &Element) {
    let mut stack = vec![element.clone()];
    while let Some(el) = stack.pop() {
        el.write().removed = true;
        inner.index.remove(el.id());
        stack.extend(el.children());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn store() -> Arc<DataStore> {
        let ctx = DStoreContext::new(Arc::new(Config::for_root("/tmp")));
        DataStore::new(ctx, "srv")
    }

    fn assert_tree_consistent(store: &DataStore) {
        for el in store.subtree(store.root()) {
            for child in el.children() {
                let parent = child.parent().expect("child without parent");
                assert!(parent.ptr_eq(&el), "{} lists {} but parent differs", el.id(), child.id());
            }
            if let Some(parent) = el.parent() {
                assert!(
                    parent.children().iter().any(|c| c.ptr_eq(&el)),
                    "{} not listed by its parent",
                    el.id()
                );
            }
        }
    }

    #[test]
    fn create_keeps_insertion_order_and_parent_links() {
        let store = store();
        let dir = store.create(store.host_root(), "universal.FolderObject", "src", "/").unwrap();
        let a = store.create(&dir, "universal.FileObject", "a.rs", "/src").unwrap();
        let b = store.create(&dir, "universal.FileObject", "b.rs", "/src").unwrap();
        assert_eq!(dir.children(), vec![a.clone(), b.clone()]);
        assert!(a.parent().unwrap().ptr_eq(&dir));
        assert_eq!(a.id().space(), "srv");
        assert_tree_consistent(&store);
    }

    #[test]
    fn removed_subtree_is_unreachable_and_stale() {
        let store = store();
        let dir = store.create(store.host_root(), "folder", "d", "").unwrap();
        let f = store.create(&dir, "file", "f", "").unwrap();
        store.remove(&dir).unwrap();
        assert!(store.find_by_id(f.id()).is_none());
        assert!(store.host_root().children().is_empty());
        assert!(matches!(store.create(&f, "file", "g", ""), Err(DStoreError::StaleElement(_))));
        assert_tree_consistent(&store);
    }

    #[test]
    fn find_respects_depth() {
        let store = store();
        let a = store.create(store.host_root(), "folder", "a", "").unwrap();
        let b = store.create(&a, "folder", "b", "").unwrap();
        store.create(&b, "file", "deep", "").unwrap();
        assert!(store.find(store.host_root(), Attribute::Name, "deep", 2).is_none());
        assert!(store.find(store.host_root(), Attribute::Name, "deep", 3).is_some());
        assert_eq!(store.find(store.host_root(), Attribute::Name, "a", 1), Some(a));
    }

    #[test]
    fn creates_racing_a_disconnect_never_land_under_a_spirit() {
        for _ in 0..20 {
            let store = store();
            let command = store.create(store.log_root(), "command", "C_EXEC", "").unwrap();
            let status = store.create_status(&command).unwrap();
            let writer = {
                let store = store.clone();
                let status = status.clone();
                std::thread::spawn(move || {
                    let mut created = Vec::new();
                    for i in 0..200 {
                        match store.create(&status, "stdout", "line", i.to_string()) {
                            Ok(el) => created.push(el),
                            Err(e) => {
                                assert!(matches!(e, DStoreError::StaleElement(_)));
                                break;
                            }
                        }
                    }
                    created
                })
            };
            assert!(store.disconnect(&command));
            let created = writer.join().unwrap();
            assert!(created.iter().all(|el| store.find_by_id(el.id()).is_none()));
            assert!(created.iter().all(|el| el.is_spirit()));
            assert_eq!(store.len(), 5);
        }
    }

    #[test]
    fn torn_down_store_rejects_mutations() {
        let store = store();
        let el = store.create(store.host_root(), "file", "x", "").unwrap();
        store.set_connected(false);
        let err = store.set_attribute(&el, Attribute::Value, "y").unwrap_err();
        assert!(matches!(err, DStoreError::StaleElement(_)));
    }

    #[test]
    fn status_never_moves_backwards() {
        let store = store();
        let cmd = store.create(store.log_root(), "command", "C_QUERY_ROOTS", "").unwrap();
        let status = store.create_status(&cmd).unwrap();
        assert!(store.set_status(&status, StatusState::Updating).unwrap());
        assert!(!store.set_status(&status, StatusState::Pending).unwrap());
        assert!(store.set_status(&status, StatusState::Done).unwrap());
        assert!(!store.set_status(&status, StatusState::Cancelled).unwrap());
        assert_eq!(store.status_state(&status), StatusState::Done);
        assert_eq!(status.value(), "done");
    }

    #[test]
    fn mutations_mirror_only_the_delta() {
        let store = store();
        let (tx, mut rx) = delta_channel();
        store.set_mirror(tx);
        let dir = store.create(store.host_root(), "folder", "d", "").unwrap();
        store.create(&dir, "file", "f", "").unwrap();
        store.set_attribute(&dir, Attribute::Value, "/x").unwrap();

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Delta::Created { ref parent, .. } if parent.as_str() == HOST_ROOT_ID));
        assert!(matches!(rx.try_recv().unwrap(), Delta::Created { .. }));
        match rx.try_recv().unwrap() {
            Delta::Updated { element } => {
                assert_eq!(element.value, "/x");
                assert_eq!(&element.id, dir.id());
            }
            other => panic!("unexpected delta {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replica_follows_deltas() {
        let server = store();
        let ctx = DStoreContext::new(Arc::new(Config::for_root("/tmp")));
        let client = DataStore::new(ctx, "cli");
        let (tx, mut rx) = delta_channel();
        server.set_mirror(tx);

        let dir = server.create(server.host_root(), "folder", "d", "").unwrap();
        let f = server.create(&dir, "file", "f", "1").unwrap();
        server.set_attribute(&f, Attribute::Value, "2").unwrap();
        while let Ok(delta) = rx.try_recv() {
            client.apply(delta).unwrap();
        }
        let mirrored = client.find_by_id(f.id()).unwrap();
        assert_eq!(mirrored.value(), "2");
        assert_eq!(mirrored.parent().unwrap().id(), dir.id());

        assert!(server.disconnect(&f));
        while let Ok(delta) = rx.try_recv() {
            client.apply(delta).unwrap();
        }
        assert!(client.find_by_id(f.id()).is_none());
        assert!(mirrored.is_spirit());
        assert_tree_consistent(&client);
    }

    #[test]
    fn snapshot_deltas_rebuild_a_subtree() {
        let server = store();
        let miner = server.create(server.miner_root(), "miner", "EnvironmentMiner", "").unwrap();
        let env = server.create(&miner, "environment", "System Environment", "").unwrap();
        server.create(&env, "Environment Variable", "HOME", "HOME=/root").unwrap();

        let client = store();
        for delta in server.snapshot_deltas(server.miner_root()) {
            client.apply(delta).unwrap();
        }
        let replica = client.find_by_id(env.id()).unwrap();
        assert_eq!(replica.parent().unwrap().id(), miner.id());
        assert_eq!(replica.children()[0].value(), "HOME=/root");
        assert_tree_consistent(&client);
    }

    #[tokio::test]
    async fn transfer_needs_a_peer() {
        let server = store();
        let status = server.create(server.log_root(), STATUS_TYPE, "status", "start").unwrap();
        assert!(matches!(
            server.transfer(&status, "/tmp/x", 0, vec![1]).await,
            Err(DStoreError::Transport(_))
        ));
        let (tx, mut rx) = delta_channel();
        server.set_mirror(tx);
        server.transfer(&status, "/tmp/x", 0, vec![1, 2]).await.unwrap();
        match rx.try_recv().unwrap() {
            Delta::Transfer { status: id, data, .. } => {
                assert_eq!(&id, status.id());
                assert_eq!(data, vec![1, 2]);
            }
            other => panic!("unexpected delta {:?}", other),
        }
    }

    #[test]
    fn disconnected_element_is_reclaimed_with_last_handle() {
        let store = store();
        let el = store.create(store.temp_root(), "file", "t", "").unwrap();
        assert!(store.disconnect(&el));
        assert!(!store.disconnect(&el));
        assert!(el.is_spirit());
        assert!(el.parent().is_none());
        assert!(store.find_by_id(el.id()).is_none());
        assert_eq!(store.temp_root().child_count(), 0);
        let counters = store.context().counters().clone();
        assert_eq!(counters.snapshot().disconnected, 1);
        let before = counters.snapshot().reclaimed;
        drop(el);
        assert_eq!(counters.snapshot().reclaimed, before + 1);
        assert_tree_consistent(&store);
    }
}

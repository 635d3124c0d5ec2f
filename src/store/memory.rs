//! In-memory coordination store used by tests and demos.
//!
//! One [`MemoryStore`] holds the shared tree; [`MemoryStore::session`]
//! hands out session handles implementing [`CoordStore`]. Per-node
//! read/write locks are waited on asynchronously, nodes connected with
//! auto-delete disappear when their connection closes or their session is
//! killed, and subscribers receive events for their node and its subtree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    ConnectMode, CoordConnection, CoordStore, LockKind, Result, SessionId, StoreError, StoreEvent,
};
use crate::tree::PropTree;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    name: String,
    key: Option<String>,
}

fn parse_xpath(xpath: &str) -> Result<Vec<Segment>> {
    let trimmed = xpath.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::BadPath(xpath.to_string()));
    }
    let mut segs = Vec::new();
    for raw in trimmed.split('/') {
        let (name, key) = match raw.find('[') {
            Some(b) => {
                let key = raw[b..]
                    .strip_prefix("[@name=\"")
                    .and_then(|r| r.strip_suffix("\"]"))
                    .ok_or_else(|| StoreError::BadPath(xpath.to_string()))?;
                (&raw[..b], Some(key.to_string()))
            }
            None => (raw, None),
        };
        if name.is_empty() {
            return Err(StoreError::BadPath(xpath.to_string()));
        }
        segs.push(Segment { name: name.to_string(), key });
    }
    Ok(segs)
}

fn canonical(segs: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segs {
        out.push('/');
        out.push_str(&seg.name);
        if let Some(k) = &seg.key {
            out.push_str("[@name=\"");
            out.push_str(k);
            out.push_str("\"]");
        }
    }
    out
}

fn seg_matches(node: &PropTree, seg: &Segment) -> bool {
    node.name() == seg.name
        && match &seg.key {
            Some(k) => node.attr("@name") == Some(k.as_str()),
            None => true,
        }
}

/// Resolves `segs` under `root`; returns the node and whether any node was
/// created along the way.
fn resolve<'a>(
    root: &'a mut PropTree,
    segs: &[Segment],
    create: bool,
) -> Option<(&'a mut PropTree, bool)> {
    let mut cur = root;
    let mut created = false;
    for seg in segs {
        let idx = match cur.children().iter().position(|c| seg_matches(c, seg)) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                let mut node = PropTree::new(&seg.name);
                if let Some(k) = &seg.key {
                    node.set_attr("@name", k.clone());
                }
                cur.add_child(node);
                created = true;
                cur.children().len() - 1
            }
        };
        cur = &mut cur.children_mut()[idx];
    }
    Some((cur, created))
}

#[derive(Debug, Default)]
struct LockState {
    readers: Vec<SessionId>,
    writer: Option<SessionId>,
}

struct Core {
    tree: Mutex<PropTree>,
    locks: DashMap<String, LockState>,
    lock_wake: Notify,
    subs: DashMap<String, Vec<async_channel::Sender<StoreEvent>>>,
    sessions: DashMap<SessionId, ()>,
    auto_delete: DashMap<String, (SessionId, Vec<Segment>)>,
    next_session: AtomicU64,
    next_id: AtomicU64,
}

impl Core {
    fn with_tree<T>(&self, f: impl FnOnce(&mut PropTree) -> T) -> T {
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tree)
    }

    fn try_lock(&self, key: &str, kind: LockKind, session: SessionId) -> bool {
        let mut state = self.locks.entry(key.to_string()).or_default();
        match kind {
            LockKind::None => true,
            LockKind::Read => {
                if state.writer.is_some() {
                    false
                } else {
                    state.readers.push(session);
                    true
                }
            }
            LockKind::Write => {
                if state.writer.is_some() || !state.readers.is_empty() {
                    false
                } else {
                    state.writer = Some(session);
                    true
                }
            }
        }
    }

    fn try_upgrade(&self, key: &str, session: SessionId) -> bool {
        let mut state = self.locks.entry(key.to_string()).or_default();
        if state.writer.is_none() && state.readers == [session] {
            state.readers.clear();
            state.writer = Some(session);
            true
        } else {
            false
        }
    }

    fn downgrade(&self, key: &str, session: SessionId) {
        if let Some(mut state) = self.locks.get_mut(key) {
            state.writer = None;
            state.readers.push(session);
        }
        self.lock_wake.notify_waiters();
    }

    fn unlock(&self, key: &str, kind: LockKind, session: SessionId) {
        if matches!(kind, LockKind::None) {
            return;
        }
        if let Some(mut state) = self.locks.get_mut(key) {
            match kind {
                LockKind::Read => {
                    if let Some(pos) = state.readers.iter().position(|&s| s == session) {
                        state.readers.remove(pos);
                    }
                }
                LockKind::Write => {
                    if state.writer == Some(session) {
                        state.writer = None;
                    }
                }
                LockKind::None => {}
            }
        }
        self.lock_wake.notify_waiters();
    }

    async fn lock_acquire(
        &self,
        key: &str,
        kind: LockKind,
        session: SessionId,
        timeout: Duration,
    ) -> Result<()> {
        if matches!(kind, LockKind::None) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock(key, kind, session) {
                return Ok(());
            }
            let wake = self.lock_wake.notified();
            // re-check after registering so a release cannot be missed
            if self.try_lock(key, kind, session) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, wake).await.is_err() {
                if self.try_lock(key, kind, session) {
                    return Ok(());
                }
                return Err(StoreError::Timeout(key.to_string()));
            }
        }
    }

    async fn upgrade_acquire(&self, key: &str, session: SessionId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_upgrade(key, session) {
                return true;
            }
            let wake = self.lock_wake.notified();
            if self.try_upgrade(key, session) {
                return true;
            }
            if tokio::time::timeout_at(deadline, wake).await.is_err() {
                return self.try_upgrade(key, session);
            }
        }
    }

    fn fire(&self, key: &str, event: StoreEvent) {
        for mut entry in self.subs.iter_mut() {
            let path = entry.key();
            if key == path || key.starts_with(&format!("{path}/")) {
                entry.value_mut().retain(|s| !s.is_closed());
                for sender in entry.value() {
                    let _ = sender.try_send(event);
                }
            }
        }
        self.lock_wake.notify_waiters();
    }

    fn delete_node(&self, segs: &[Segment], key: &str) {
        let removed = self.with_tree(|root| {
            let Some(last) = segs.last() else {
                return false;
            };
            let parent = match resolve(root, &segs[..segs.len() - 1], false) {
                Some((node, _)) => node,
                None => return false,
            };
            let before = parent.children().len();
            parent.retain_children(|c| !seg_matches(c, last));
            parent.children().len() != before
        });
        if removed {
            self.fire(key, StoreEvent::Deleted);
        }
    }
}

/// Shared in-memory store; hand out sessions with [`Self::session`].
pub struct MemoryStore {
    core: Arc<Core>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                tree: Mutex::new(PropTree::new("")),
                locks: DashMap::new(),
                lock_wake: Notify::new(),
                subs: DashMap::new(),
                sessions: DashMap::new(),
                auto_delete: DashMap::new(),
                next_session: AtomicU64::new(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a new session.
    pub fn session(&self) -> MemorySession {
        let id = self.core.next_session.fetch_add(1, Ordering::Relaxed);
        self.core.sessions.insert(id, ());
        MemorySession { core: Arc::clone(&self.core), id }
    }

    /// Ends a session abruptly: its locks are dropped and its auto-delete
    /// nodes removed, as the real store does when a client dies.
    pub fn kill_session(&self, session: SessionId) {
        self.core.sessions.remove(&session);
        for mut entry in self.core.locks.iter_mut() {
            entry.readers.retain(|&s| s != session);
            if entry.writer == Some(session) {
                entry.writer = None;
            }
        }
        self.core.lock_wake.notify_waiters();
        let doomed: Vec<(String, Vec<Segment>)> = self
            .core
            .auto_delete
            .iter()
            .filter(|e| e.value().0 == session)
            .map(|e| (e.key().clone(), e.value().1.clone()))
            .collect();
        for (key, segs) in doomed {
            self.core.auto_delete.remove(&key);
            self.core.delete_node(&segs, &key);
        }
    }
}

/// One session of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemorySession {
    core: Arc<Core>,
    id: SessionId,
}

#[async_trait]
impl CoordStore for MemorySession {
    async fn connect(
        &self,
        xpath: &str,
        mode: ConnectMode,
        timeout: Duration,
    ) -> Result<Option<Box<dyn CoordConnection>>> {
        let segs = parse_xpath(xpath)?;
        let key = canonical(&segs);
        self.core.lock_acquire(&key, mode.lock, self.id, timeout).await?;
        let snapshot = self
            .core
            .with_tree(|root| resolve(root, &segs, mode.create).map(|(n, c)| (n.clone(), c)));
        let Some((local, created)) = snapshot else {
            self.core.unlock(&key, mode.lock, self.id);
            return Ok(None);
        };
        if created {
            self.core.fire(&key, StoreEvent::Changed);
        }
        if mode.auto_delete {
            self.core.auto_delete.insert(key.clone(), (self.id, segs.clone()));
        }
        Ok(Some(Box::new(MemoryConnection {
            core: Arc::clone(&self.core),
            session: self.id,
            segs,
            key,
            local,
            lock: mode.lock,
            auto_delete: mode.auto_delete,
            open: true,
        })))
    }

    fn my_session(&self) -> SessionId {
        self.id
    }

    fn session_alive(&self, session: SessionId) -> bool {
        self.core.sessions.contains_key(&session)
    }

    fn unique_id(&self) -> u64 {
        self.core.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct MemoryConnection {
    core: Arc<Core>,
    session: SessionId,
    segs: Vec<Segment>,
    key: String,
    local: PropTree,
    lock: LockKind,
    auto_delete: bool,
    open: bool,
}

impl MemoryConnection {
    fn release(&mut self, delete_root: bool) {
        if !self.open {
            return;
        }
        self.open = false;
        if !self.core.sessions.contains_key(&self.session) {
            // killed session: the store already dropped our locks and
            // nodes, which may since belong to someone else
            return;
        }
        self.core.unlock(&self.key, self.lock, self.session);
        if delete_root || self.auto_delete {
            self.core.auto_delete.remove(&self.key);
            self.core.delete_node(&self.segs, &self.key);
        }
    }
}

#[async_trait]
impl CoordConnection for MemoryConnection {
    fn tree(&self) -> &PropTree {
        &self.local
    }

    fn tree_mut(&mut self) -> &mut PropTree {
        &mut self.local
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.open {
            return Err(StoreError::ConnectionClosed);
        }
        let local = self.local.clone();
        self.core.with_tree(|root| {
            if let Some((node, _)) = resolve(root, &self.segs, true) {
                *node = local;
            }
        });
        self.core.fire(&self.key, StoreEvent::Changed);
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        if !self.open {
            return Err(StoreError::ConnectionClosed);
        }
        if let Some(node) =
            self.core.with_tree(|root| resolve(root, &self.segs, false).map(|(n, _)| n.clone()))
        {
            self.local = node;
        }
        Ok(())
    }

    async fn change_mode(&mut self, kind: LockKind, timeout: Duration) -> Result<bool> {
        if !self.open {
            return Err(StoreError::ConnectionClosed);
        }
        let moved = match (self.lock, kind) {
            (LockKind::Read, LockKind::Read) => true,
            (LockKind::Write, LockKind::Write) => true,
            (a, b) if a == b => true,
            (LockKind::Read, LockKind::Write) => {
                self.core.upgrade_acquire(&self.key, self.session, timeout).await
            }
            (LockKind::Write, LockKind::Read) => {
                self.core.downgrade(&self.key, self.session);
                true
            }
            (held, LockKind::None) => {
                self.core.unlock(&self.key, held, self.session);
                true
            }
            (LockKind::None, want) => self
                .core
                .lock_acquire(&self.key, want, self.session, timeout)
                .await
                .is_ok(),
        };
        if moved {
            self.lock = kind;
        }
        Ok(moved)
    }

    async fn subscribe(&mut self) -> Result<async_channel::Receiver<StoreEvent>> {
        if !self.open {
            return Err(StoreError::ConnectionClosed);
        }
        let (tx, rx) = async_channel::unbounded();
        self.core.subs.entry(self.key.clone()).or_default().push(tx);
        Ok(rx)
    }

    async fn close(mut self: Box<Self>, delete_root: bool) -> Result<()> {
        self.release(delete_root);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_commit_and_read_back() {
        let store = MemoryStore::new();
        let s = store.session();
        let mut conn = s
            .connect("/Files/Scope[@name=\"a\"]", ConnectMode::write().with_create(), tick())
            .await
            .unwrap()
            .unwrap();
        conn.tree_mut().set_attr("@kind", "scope");
        conn.commit().await.unwrap();
        conn.close(false).await.unwrap();

        let conn = s
            .connect("/Files/Scope[@name=\"a\"]", ConnectMode::read(), tick())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.tree().attr("@kind"), Some("scope"));
        conn.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn missing_node_connects_as_none() {
        let store = MemoryStore::new();
        let s = store.session();
        assert!(s.connect("/Files/Nope", ConnectMode::read(), tick()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn write_lock_excludes_and_releases() {
        let store = MemoryStore::new();
        let s = store.session();
        let first = s
            .connect("/Locks", ConnectMode::write().with_create(), tick())
            .await
            .unwrap()
            .unwrap();
        // a second writer times out while the first holds the lock
        let denied = s.connect("/Locks", ConnectMode::write(), tick()).await;
        assert!(matches!(denied, Err(StoreError::Timeout(_))));
        first.close(false).await.unwrap();
        let second = s.connect("/Locks", ConnectMode::write(), tick()).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn auto_delete_on_close_and_kill() {
        let store = MemoryStore::new();
        let s = store.session();
        let conn = s
            .connect("/Locks/Owner", ConnectMode::write().with_create().with_auto_delete(), tick())
            .await
            .unwrap()
            .unwrap();
        conn.close(false).await.unwrap();
        assert!(s.connect("/Locks/Owner", ConnectMode::read(), tick()).await.unwrap().is_none());

        let dying = store.session();
        let held = dying
            .connect("/Locks/Owner", ConnectMode::write().with_create().with_auto_delete(), tick())
            .await
            .unwrap()
            .unwrap();
        std::mem::forget(held); // crash: no clean close
        store.kill_session(dying.my_session());
        assert!(!s.session_alive(dying.my_session()));
        assert!(s.connect("/Locks/Owner", ConnectMode::read(), tick()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscription_sees_subtree_events() {
        let store = MemoryStore::new();
        let s = store.session();
        let mut top = s
            .connect("/Locks/Mutex[@name=\"m\"]", ConnectMode::write().with_create(), tick())
            .await
            .unwrap()
            .unwrap();
        let events = top.subscribe().await.unwrap();
        let child = s
            .connect(
                "/Locks/Mutex[@name=\"m\"]/Owner",
                ConnectMode::write().with_create().with_auto_delete(),
                tick(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Changed);
        child.close(false).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Deleted);
    }

    fn tick() -> Duration {
        Duration::from_millis(200)
    }
}

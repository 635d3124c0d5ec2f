//! Coordination scenarios against the in-memory store: mutex handoff and
//! takeover, lock upgrades, and the redirection table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dfs_names::dmutex::{safe_change_mode_write, MutexNotify, NamedMutex};
use dfs_names::redirect::Redirection;
use dfs_names::store::memory::MemoryStore;
use dfs_names::store::{ConnectMode, CoordStore, StoreError};

const TICK: Duration = Duration::from_millis(200);

#[derive(Default)]
struct CountingNotify {
    starts: AtomicU32,
    cycles: AtomicU32,
    stops: AtomicU32,
}

impl MutexNotify for CountingNotify {
    fn start_wait(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn cycle_wait(&self) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }
    fn stop_wait(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reads the owner through the mutex node; the holder keeps a write lock
/// on the `Owner` node itself.
async fn owner_session(store: &dyn CoordStore, name: &str) -> Option<u64> {
    let conn = store
        .connect(&format!("/Locks/Mutex[@name=\"{name}\"]"), ConnectMode::read(), TICK)
        .await
        .unwrap()?;
    let session = conn.tree().first_child("Owner").and_then(|o| o.attr_u64("@session"));
    conn.close(false).await.unwrap();
    session
}

#[tokio::test(start_paused = true)]
async fn mutex_hands_over_on_clean_release() {
    let store = MemoryStore::new();
    let s1 = store.session();
    let s2 = store.session();
    let m1 = NamedMutex::new(Arc::new(s1.clone()), "handoff");
    let m2 = Arc::new(NamedMutex::new(Arc::new(s2.clone()), "handoff"));

    assert!(m1.acquire(None, None).await.unwrap());
    assert_eq!(owner_session(&s1, "handoff").await, Some(s1.my_session()));

    let waiter = {
        let m2 = Arc::clone(&m2);
        tokio::spawn(async move {
            let notify = CountingNotify::default();
            let ok = m2.acquire(Some(Duration::from_secs(600)), Some(&notify)).await.unwrap();
            (ok, notify.starts.load(Ordering::SeqCst), notify.stops.load(Ordering::SeqCst))
        })
    };

    // let the waiter subscribe, then release; the Owner node auto-deletes
    // and the waiter takes over
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(owner_session(&s1, "handoff").await, Some(s1.my_session()));
    m1.release().await.unwrap();

    let (ok, starts, stops) = waiter.await.unwrap();
    assert!(ok);
    assert_eq!(starts, 1);
    assert_eq!(stops, 1);
    assert_eq!(owner_session(&s2, "handoff").await, Some(s2.my_session()));
    assert!(m2.locked().await);
    m2.release().await.unwrap();
    assert_eq!(owner_session(&s2, "handoff").await, None);
}

#[tokio::test(start_paused = true)]
async fn mutex_takes_over_a_dead_owner_without_waiting() {
    let store = MemoryStore::new();
    let s = store.session();

    // plant an Owner carrying a session the store has never kept alive
    let mut conn = s
        .connect(
            "/Locks/Mutex[@name=\"stale\"]/Owner",
            ConnectMode::write().with_create(),
            TICK,
        )
        .await
        .unwrap()
        .unwrap();
    conn.tree_mut().set_attr("@session", "424242");
    conn.commit().await.unwrap();
    conn.close(false).await.unwrap();

    let m = NamedMutex::new(Arc::new(s.clone()), "stale");
    let before = tokio::time::Instant::now();
    assert!(m.acquire(Some(Duration::from_secs(600)), None).await.unwrap());
    // no waiting happened: the paused clock never advanced
    assert_eq!(tokio::time::Instant::now(), before);
    assert_eq!(owner_session(&s, "stale").await, Some(s.my_session()));
    m.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn killed_session_releases_the_mutex() {
    let store = MemoryStore::new();
    let s1 = store.session();
    let s2 = store.session();
    let m1 = NamedMutex::new(Arc::new(s1.clone()), "crash");
    assert!(m1.acquire(None, None).await.unwrap());

    let m2 = Arc::new(NamedMutex::new(Arc::new(s2.clone()), "crash"));
    let waiter = {
        let m2 = Arc::clone(&m2);
        tokio::spawn(async move { m2.acquire(Some(Duration::from_secs(600)), None).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // owner dies without releasing; the store drops its auto-delete node
    store.kill_session(s1.my_session());

    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(owner_session(&s2, "crash").await, Some(s2.my_session()));
}

#[tokio::test(start_paused = true)]
async fn mutex_recursion_counts_acquires() {
    let store = MemoryStore::new();
    let s = store.session();
    let m = NamedMutex::new(Arc::new(s.clone()), "recurse");
    assert!(m.acquire(None, None).await.unwrap());
    assert!(m.acquire(None, None).await.unwrap());
    m.release().await.unwrap();
    assert!(m.locked().await);
    assert_eq!(owner_session(&s, "recurse").await, Some(s.my_session()));
    m.release().await.unwrap();
    assert!(!m.locked().await);
    assert_eq!(owner_session(&s, "recurse").await, None);
}

#[tokio::test(start_paused = true)]
async fn mutex_acquire_times_out() {
    let store = MemoryStore::new();
    let s1 = store.session();
    let s2 = store.session();
    let m1 = NamedMutex::new(Arc::new(s1), "busy");
    assert!(m1.acquire(None, None).await.unwrap());

    let m2 = NamedMutex::new(Arc::new(s2), "busy");
    let notify = CountingNotify::default();
    let ok = m2.acquire(Some(Duration::from_secs(90)), Some(&notify)).await.unwrap();
    assert!(!ok);
    assert_eq!(notify.starts.load(Ordering::SeqCst), 1);
    assert_eq!(notify.stops.load(Ordering::SeqCst), 1);
    assert!(notify.cycles.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn kill_aborts_a_waiting_acquire() {
    let store = MemoryStore::new();
    let s1 = store.session();
    let s2 = store.session();
    let m1 = NamedMutex::new(Arc::new(s1), "doomed");
    assert!(m1.acquire(None, None).await.unwrap());

    let m2 = Arc::new(NamedMutex::new(Arc::new(s2), "doomed"));
    let waiter = {
        let m2 = Arc::clone(&m2);
        tokio::spawn(async move { m2.acquire(None, None).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    m2.kill();
    assert!(matches!(waiter.await.unwrap(), Err(StoreError::Aborted)));
}

#[tokio::test(start_paused = true)]
async fn lock_upgrade_drops_and_reloads_when_contended() {
    let store = MemoryStore::new();
    let s = store.session();

    let mut seed = s
        .connect("/Files/Shared", ConnectMode::write().with_create(), TICK)
        .await
        .unwrap()
        .unwrap();
    seed.commit().await.unwrap();
    seed.close(false).await.unwrap();

    let mut upgrading =
        s.connect("/Files/Shared", ConnectMode::read(), TICK).await.unwrap().unwrap();
    let blocking = s.connect("/Files/Shared", ConnectMode::read(), TICK).await.unwrap().unwrap();

    let task = tokio::spawn(async move {
        let reload = safe_change_mode_write(upgrading.as_mut(), None).await;
        (reload, upgrading)
    });

    // the upgrade gives up its lock after the five-minute step; while it
    // pauses, update the branch and drop the other reader
    tokio::time::sleep(Duration::from_secs(310)).await;
    blocking.close(false).await.unwrap();
    let mut writer =
        s.connect("/Files/Shared", ConnectMode::write(), TICK).await.unwrap().unwrap();
    writer.tree_mut().set_attr("@touched", "yes");
    writer.commit().await.unwrap();
    writer.close(false).await.unwrap();

    let (reload, upgraded) = task.await.unwrap();
    // the climb dropped the lock, so the caller must refresh its view;
    // the reload already sees the concurrent write
    assert!(reload.unwrap());
    assert_eq!(upgraded.tree().attr("@touched"), Some("yes"));
    upgraded.close(false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn redirection_rules_flow_through_the_store() {
    let store = MemoryStore::new();
    let s = store.session();
    let redirect = Redirection::with_reload_interval(Arc::new(s.clone()), Duration::ZERO);

    // empty store, empty table
    assert!(redirect.table().await.is_empty());

    redirect.update("foo::*", "bar::$1", 0, false).await.unwrap();
    let hits: Vec<_> =
        redirect.resolve("foo::baz").await.map(|l| l.as_str().to_string()).collect();
    assert_eq!(hits, vec!["bar::baz"]);
    assert_eq!(redirect.table().await.version(), 1);

    // a blocker prepended later hides the wildcard match
    redirect.update("foo::secret", "", 0, false).await.unwrap();
    assert_eq!(redirect.table().await.version(), 2);
    assert_eq!(redirect.resolve("foo::secret").await.count(), 0);
    let open: Vec<_> =
        redirect.resolve("foo::open").await.map(|l| l.as_str().to_string()).collect();
    assert_eq!(open, vec!["bar::open"]);

    // a second view reads the same table through the store
    let fresh = Redirection::with_reload_interval(Arc::new(s.clone()), Duration::ZERO);
    assert_eq!(fresh.table().await.len(), 2);
    assert_eq!(fresh.table().await.version(), 2);
}

#[tokio::test(start_paused = true)]
async fn redirection_reload_is_gated() {
    let store = MemoryStore::new();
    let s = store.session();
    let writer = Redirection::with_reload_interval(Arc::new(s.clone()), Duration::ZERO);
    let reader = Redirection::new(Arc::new(s.clone()));

    writer.update("a::*", "b::$1", 0, false).await.unwrap();
    assert_eq!(reader.table().await.version(), 1);

    // a second update is invisible inside the gate window
    writer.update("c::*", "d::$1", 0, false).await.unwrap();
    assert_eq!(reader.table().await.version(), 1);

    // and visible after it passes
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(reader.table().await.version(), 2);
}

//! Cluster-wide named mutex rooted in the coordination store, plus the
//! safe lock-upgrade helper.
//!
//! A mutex `M` lives at `/Locks/Mutex[@name="M"]`. Its `Owner` child
//! carries the owning session and is created auto-delete-on-disconnect,
//! so a crashed owner releases the lock when the store notices the dead
//! session. Waiters subscribe to the mutex node and sleep in bounded
//! steps (one minute first, then up to five), re-checking ownership on
//! every wake. Acquisition by the same process recurses locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::{
    ConnectMode, CoordConnection, CoordStore, LockKind, Result, SessionId, StoreError,
    SDS_LOCK_TIMEOUT,
};

/// First wait between ownership checks.
pub const LOCK_POLL_FIRST: Duration = Duration::from_secs(60);
/// Later waits between ownership checks.
pub const LOCK_POLL: Duration = Duration::from_secs(5 * 60);

/// Progress hooks invoked around mutex waits.
pub trait MutexNotify: Send + Sync {
    /// Called once when waiting begins.
    fn start_wait(&self) {}
    /// Called on every wake while waiting.
    fn cycle_wait(&self) {}
    /// Called once when waiting ends, acquired or not.
    fn stop_wait(&self) {}
}

struct MutexState {
    recursion: u32,
    owner: Option<Box<dyn CoordConnection>>,
}

/// A named cluster-wide mutex.
pub struct NamedMutex {
    store: Arc<dyn CoordStore>,
    name: String,
    state: tokio::sync::Mutex<MutexState>,
    stopping: AtomicBool,
    kill_wake: Notify,
    poll_first: Duration,
    poll: Duration,
}

impl NamedMutex {
    /// Binds a mutex name to a store.
    pub fn new(store: Arc<dyn CoordStore>, name: &str) -> Self {
        Self::with_polls(store, name, LOCK_POLL_FIRST, LOCK_POLL)
    }

    /// [`Self::new`] with explicit wait steps.
    pub fn with_polls(
        store: Arc<dyn CoordStore>,
        name: &str,
        poll_first: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            name: name.to_string(),
            state: tokio::sync::Mutex::new(MutexState { recursion: 0, owner: None }),
            stopping: AtomicBool::new(false),
            kill_wake: Notify::new(),
            poll_first,
            poll,
        }
    }

    /// Mutex name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn mutex_path(&self) -> String {
        format!("/Locks/Mutex[@name=\"{}\"]", self.name)
    }

    fn owner_path(&self) -> String {
        format!("{}/Owner", self.mutex_path())
    }

    /// True while this process holds the mutex.
    pub async fn locked(&self) -> bool {
        self.state.lock().await.recursion > 0
    }

    /// Wakes and cancels any in-flight [`Self::acquire`].
    pub fn kill(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.kill_wake.notify_waiters();
    }

    /// Acquires the mutex, waiting up to `timeout` (forever when `None`).
    /// `Ok(false)` reports an expired timeout.
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
        notify: Option<&dyn MutexNotify>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.recursion > 0 {
            state.recursion += 1;
            return Ok(true);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut first = true;
        let mut waiting = false;
        let result = self.acquire_loop(&mut state, deadline, notify, &mut first, &mut waiting).await;
        if waiting {
            if let Some(n) = notify {
                n.stop_wait();
            }
        }
        result
    }

    async fn acquire_loop(
        &self,
        state: &mut MutexState,
        deadline: Option<Instant>,
        notify: Option<&dyn MutexNotify>,
        first: &mut bool,
        waiting: &mut bool,
    ) -> Result<bool> {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Err(StoreError::Aborted);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(false);
                }
            }
            let conn = match self
                .store
                .connect(&self.mutex_path(), ConnectMode::write(), SDS_LOCK_TIMEOUT)
                .await?
            {
                Some(conn) => conn,
                None => {
                    // first comer creates the lock branch
                    let Some(mut conn) = self
                        .store
                        .connect(
                            &self.mutex_path(),
                            ConnectMode::write().with_create(),
                            SDS_LOCK_TIMEOUT,
                        )
                        .await?
                    else {
                        return Err(StoreError::Unavailable);
                    };
                    conn.commit().await?;
                    conn.close(false).await?;
                    continue;
                }
            };
            let owner: Option<SessionId> =
                conn.tree().first_child("Owner").and_then(|o| o.attr_u64("@session"));
            let free = match owner {
                None => true,
                Some(session) => {
                    let alive = self.store.session_alive(session);
                    if !alive {
                        debug!("mutex {} owner session {session} stopped", self.name);
                    }
                    !alive
                }
            };
            if free {
                let Some(mut oc) = self
                    .store
                    .connect(
                        &self.owner_path(),
                        ConnectMode::write().with_create().with_auto_delete(),
                        SDS_LOCK_TIMEOUT,
                    )
                    .await?
                else {
                    return Err(StoreError::Unavailable);
                };
                oc.tree_mut().set_attr("@session", self.store.my_session().to_string());
                oc.commit().await?;
                conn.close(false).await?;
                state.recursion = 1;
                state.owner = Some(oc);
                return Ok(true);
            }
            // held elsewhere: watch the mutex node, release the lock, wait
            let mut conn = conn;
            let events = conn.subscribe().await?;
            conn.close(false).await?;
            if !*waiting {
                *waiting = true;
                if let Some(n) = notify {
                    n.start_wait();
                }
            }
            let step = if *first { self.poll_first } else { self.poll };
            *first = false;
            let mut wait = step;
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(Instant::now()));
            }
            tokio::select! {
                _ = events.recv() => {}
                _ = self.kill_wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            if let Some(n) = notify {
                n.cycle_wait();
            }
        }
    }

    /// Releases one level of recursion; the last release drops the `Owner`
    /// connection, auto-deleting the node.
    pub async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.recursion == 0 {
            warn!("release of unheld mutex {}", self.name);
            return Ok(());
        }
        state.recursion -= 1;
        if state.recursion == 0 {
            if let Some(owner) = state.owner.take() {
                owner.close(false).await?;
            }
        }
        Ok(())
    }
}

/// Upgrades a connection's lock to write without deadlocking against
/// other upgraders: stepwise `change_mode` tries, and on each timeout the
/// lock is dropped entirely, a random 30–90 s pause taken, and the climb
/// retried. `Ok(true)` reports that the lock was dropped on the way up,
/// so the caller's cached branch was reloaded and its in-memory state
/// must be refreshed. Errors with [`StoreError::Timeout`] when `timeout`
/// expires.
pub async fn safe_change_mode_write(
    conn: &mut dyn CoordConnection,
    timeout: Option<Duration>,
) -> Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut dropped = false;
    loop {
        let mut step = SDS_LOCK_TIMEOUT;
        if let Some(d) = deadline {
            let remaining = d.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::Timeout("write upgrade".to_string()));
            }
            step = step.min(remaining);
        }
        if conn.change_mode(LockKind::Write, step).await? {
            if dropped {
                conn.reload().await?;
            }
            return Ok(dropped);
        }
        // drop out entirely to break upgrade deadlock chains
        conn.change_mode(LockKind::None, Duration::ZERO).await?;
        dropped = true;
        let pause = Duration::from_secs(rand::thread_rng().gen_range(30..=90));
        warn!("write upgrade blocked, retrying in {}s", pause.as_secs());
        let pause = match deadline {
            Some(d) => pause.min(d.saturating_duration_since(Instant::now())),
            None => pause,
        };
        tokio::time::sleep(pause).await;
    }
}

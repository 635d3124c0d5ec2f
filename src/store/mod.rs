//! Coordination-store seam: traits and types through which the naming and
//! coordination services talk to the hierarchical store.
//!
//! A [`CoordStore`] hands out [`CoordConnection`]s rooted at an XPath.
//! A connection carries a client-side cached copy of its branch; writes
//! become visible on [`CoordConnection::commit`]. Locks are taken at
//! connect time and can be moved with [`CoordConnection::change_mode`].
//! Nodes created with [`ConnectMode::auto_delete`] disappear when their
//! connection closes or the creating session dies.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::tree::PropTree;

/// File namespace root.
pub const FILES_ROOT: &str = "Files";
/// File relationship table root.
pub const RELATIONSHIPS_ROOT: &str = "Files/Relationships";
/// Redirection table root.
pub const REDIRECTION_ROOT: &str = "Files/Redirection";
/// Lock namespace root.
pub const LOCKS_ROOT: &str = "Locks";

/// Store connect timeout; better than infinite.
pub const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
/// Standard lock timeout for store transactions.
pub const SDS_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Identifier of a store session.
pub type SessionId = u64;

/// Result of store operations with error type [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The coordination store cannot be reached.
    #[error("coordination store is unavailable")]
    Unavailable,
    /// A lock could not be taken before the timeout.
    #[error("timed out locking {0}")]
    Timeout(String),
    /// The connection was already closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The operation was cancelled.
    #[error("operation aborted")]
    Aborted,
    /// The XPath cannot be parsed.
    #[error("invalid store path ({0})")]
    BadPath(String),
}

/// Lock strength held by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockKind {
    /// No lock.
    #[default]
    None,
    /// Shared read lock.
    Read,
    /// Exclusive write lock.
    Write,
}

/// How to connect: lock strength plus creation and lifetime flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectMode {
    /// Lock taken at connect time.
    pub lock: LockKind,
    /// Create the node (and missing ancestors) when absent.
    pub create: bool,
    /// Remove the node when the connection closes or its session dies.
    pub auto_delete: bool,
}

impl ConnectMode {
    /// Shared read connection.
    pub fn read() -> Self {
        Self { lock: LockKind::Read, ..Self::default() }
    }

    /// Exclusive write connection.
    pub fn write() -> Self {
        Self { lock: LockKind::Write, ..Self::default() }
    }

    /// Adds path creation.
    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    /// Adds auto-delete-on-disconnect.
    pub fn with_auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }
}

/// Change notifications delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// The node or its subtree changed.
    Changed,
    /// The node was deleted.
    Deleted,
}

/// A hierarchical coordination store.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Connects to the node at `xpath`, taking the requested lock.
    /// `Ok(None)` means the node does not exist (and creation was not
    /// requested).
    async fn connect(
        &self,
        xpath: &str,
        mode: ConnectMode,
        timeout: Duration,
    ) -> Result<Option<Box<dyn CoordConnection>>>;

    /// Session this handle operates under.
    fn my_session(&self) -> SessionId;

    /// True while `session` is alive.
    fn session_alive(&self, session: SessionId) -> bool;

    /// Next value of the store-wide unique-id service (never zero).
    fn unique_id(&self) -> u64;
}

/// A connection to one store branch.
#[async_trait]
pub trait CoordConnection: Send {
    /// Cached view of the connected branch.
    fn tree(&self) -> &PropTree;

    /// Cached view of the connected branch, mutable. Changes become
    /// visible to other connections on [`Self::commit`].
    fn tree_mut(&mut self) -> &mut PropTree;

    /// Publishes local changes to the store.
    async fn commit(&mut self) -> Result<()>;

    /// Replaces the cached view with the store's current state.
    async fn reload(&mut self) -> Result<()>;

    /// Moves the held lock to `kind`, waiting up to `timeout`; `Ok(false)`
    /// means the lock could not be moved in time.
    async fn change_mode(&mut self, kind: LockKind, timeout: Duration) -> Result<bool>;

    /// Subscribes to change events for the connected node and its subtree.
    async fn subscribe(&mut self) -> Result<async_channel::Receiver<StoreEvent>>;

    /// Releases the connection; `delete_root` removes the connected node.
    async fn close(self: Box<Self>, delete_root: bool) -> Result<()>;
}

//! Coordination Store Module
//!
//! The protocols only talk to the store through [`StoreClient`]. The store
//! itself (consensus, durability, session tracking) is an external
//! collaborator; [`MemoryStore`] is an in-process implementation of the
//! same contract used by the embedded CLI runs and by the tests.
//!
//! Watches are single-fire. A `watch_*` call returns the current state and
//! arms one notification, which is delivered as a [`StoreEvent`] on the
//! queue returned by [`StoreClient::take_events`]. Whoever wants to keep
//! observing must call `watch_*` again after handling the event.

pub mod memory;
pub mod path;

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::{MemoryClient, MemoryStore};

/// Store-assigned session identifier
pub type SessionId = u64;

/// Queue on which a client receives watch and session notifications
pub type EventReceiver = mpsc::UnboundedReceiver<StoreEvent>;

/// Flags used when creating a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateMode {
    /// Deleted when the owning session ends
    pub ephemeral: bool,
    /// Store appends a monotonically increasing suffix to the name
    pub sequential: bool,
}

impl CreateMode {
    pub const PERSISTENT: CreateMode = CreateMode { ephemeral: false, sequential: false };
    pub const PERSISTENT_SEQUENTIAL: CreateMode = CreateMode { ephemeral: false, sequential: true };
    pub const EPHEMERAL: CreateMode = CreateMode { ephemeral: true, sequential: false };
    pub const EPHEMERAL_SEQUENTIAL: CreateMode = CreateMode { ephemeral: true, sequential: true };
}

/// Node metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Data version, incremented by every value write
    pub version: u64,
    /// Store transaction that created the node
    pub created_txn: u64,
    /// Store transaction that last modified the node's value
    pub modified_txn: u64,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<SessionId>,
    /// Number of direct children
    pub num_children: usize,
}

/// What a watch observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WatchKind {
    /// The set of child names of a path
    Children,
    /// The value (and existence) of a single node
    Value,
}

/// A watched path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchTarget {
    pub path: String,
    pub kind: WatchKind,
}

impl WatchTarget {
    pub fn children(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: WatchKind::Children }
    }

    pub fn value(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: WatchKind::Value }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            WatchKind::Children => write!(f, "children({})", self.path),
            WatchKind::Value => write!(f, "value({})", self.path),
        }
    }
}

/// Session lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The session is live again
    Connected,
    /// The connection dropped; ephemerals survive until the session expires
    Disconnected,
    /// The store declared the session dead and removed its ephemerals
    Expired,
}

/// A notification delivered on the client's event queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A single-fire watch fired; the target is no longer armed
    Watch(WatchTarget),
    /// Session state changed
    Session(SessionEvent),
}

/// Outcome of a successful reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnected {
    /// The session id now in use
    pub session: SessionId,
    /// True when the old session had expired and a new one was created,
    /// meaning every ephemeral node of the old session is gone
    pub renewed: bool,
}

/// Minimal operations the coordination protocols need from the store
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Current session id
    fn session_id(&self) -> SessionId;

    /// Take the event queue. Returns `None` once taken.
    fn take_events(&self) -> Option<EventReceiver>;

    /// Idempotently create `path` and all of its ancestors as persistent nodes
    async fn ensure_path(&self, path: &str) -> Result<()>;

    /// Create a node named `prefix` (plus a suffix when sequential) under
    /// `path`. Returns the full path of the created node.
    async fn create_member(
        &self,
        path: &str,
        prefix: &str,
        mode: CreateMode,
        value: Bytes,
    ) -> Result<String>;

    /// Delete a node. Fails with `NoNode` when it is already gone.
    async fn delete(&self, node: &str) -> Result<()>;

    /// Child names of `path`
    async fn children(&self, path: &str) -> Result<BTreeSet<String>>;

    /// Value and metadata of `path`
    async fn get_value(&self, path: &str) -> Result<(Bytes, Stat)>;

    /// Overwrite the value of `path`
    async fn set_value(&self, path: &str, value: Bytes) -> Result<Stat>;

    /// Child names of `path`, arming a single-fire children watch
    async fn watch_children(&self, path: &str) -> Result<BTreeSet<String>>;

    /// Value of `path` if it exists, arming a single-fire value watch that
    /// also fires on creation and deletion
    async fn watch_value(&self, path: &str) -> Result<Option<(Bytes, Stat)>>;

    /// Re-establish the connection after `Disconnected` or `Expired`
    async fn reconnect(&self) -> Result<Reconnected>;

    /// End the session, deleting its ephemeral nodes
    async fn close(&self) -> Result<()>;
}

//! In-process coordination store
//!
//! A single hierarchical tree shared by every [`MemoryClient`] connected to
//! the same [`MemoryStore`]. It honours the contract the protocols rely on:
//! linearizable writes (one lock), ephemeral nodes bound to the creating
//! session, per-parent strictly increasing sequential suffixes, and
//! single-fire watches that are dropped once delivered.
//!
//! The fault hooks (`partition`, `heal`, `expire_session`) stand in for the
//! network. A store built with [`MemoryStore::with_session_timeout`] also
//! expires the session of a client that stays partitioned for that long.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::path;
use super::{
    CreateMode, EventReceiver, Reconnected, SessionEvent, SessionId, Stat, StoreClient,
    StoreEvent, WatchKind, WatchTarget,
};
use crate::error::{Error, Result};

/// Handle identifying one connected client inside the store
pub type ClientId = u64;

/// Width of the zero-padded sequential suffix
pub const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug)]
struct Node {
    value: Bytes,
    version: u64,
    created_txn: u64,
    modified_txn: u64,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl Node {
    fn new(value: Bytes, txn: u64, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            value,
            version: 0,
            created_txn: txn,
            modified_txn: txn,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            created_txn: self.created_txn,
            modified_txn: self.modified_txn,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Connected,
    Suspended,
    Expired,
    Closed,
}

#[derive(Debug)]
struct ClientSlot {
    session: SessionId,
    link: Link,
    partitioned: bool,
    /// Bumped on every partition so a stale session timer is ignored
    partitions: u64,
    events: mpsc::UnboundedSender<StoreEvent>,
}

impl ClientSlot {
    fn notify(&self, event: StoreEvent) {
        // Receiver may already be gone after shutdown
        let _ = self.events.send(event);
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
    txn: u64,
    next_session: SessionId,
    next_client: ClientId,
    clients: HashMap<ClientId, ClientSlot>,
    child_watches: HashMap<String, BTreeSet<ClientId>>,
    value_watches: HashMap<String, BTreeSet<ClientId>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(path::ROOT.to_string(), Node::new(Bytes::new(), 0, None));
        Self {
            nodes,
            txn: 0,
            next_session: 1,
            next_client: 1,
            clients: HashMap::new(),
            child_watches: HashMap::new(),
            value_watches: HashMap::new(),
        }
    }

    fn next_txn(&mut self) -> u64 {
        self.txn += 1;
        self.txn
    }

    fn new_session(&mut self) -> SessionId {
        let session = self.next_session;
        self.next_session += 1;
        session
    }

    /// Session of a client allowed to issue requests
    fn live_session(&self, client: ClientId) -> Result<SessionId> {
        let slot = self.clients.get(&client).ok_or(Error::ShuttingDown)?;
        if slot.partitioned {
            return Err(Error::Disconnected);
        }
        match slot.link {
            Link::Connected => Ok(slot.session),
            Link::Suspended => Err(Error::Disconnected),
            Link::Expired => Err(Error::SessionExpired),
            Link::Closed => Err(Error::ShuttingDown),
        }
    }

    fn fire(&mut self, target: WatchTarget) {
        let watches = match target.kind {
            WatchKind::Children => &mut self.child_watches,
            WatchKind::Value => &mut self.value_watches,
        };
        let Some(watchers) = watches.remove(&target.path) else {
            return;
        };
        for client in watchers {
            if let Some(slot) = self.clients.get(&client) {
                if slot.link == Link::Connected && !slot.partitioned {
                    slot.notify(StoreEvent::Watch(target.clone()));
                }
            }
        }
    }

    fn drop_watches(&mut self, client: ClientId) {
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&client);
        }
        for watchers in self.value_watches.values_mut() {
            watchers.remove(&client);
        }
        self.child_watches.retain(|_, w| !w.is_empty());
        self.value_watches.retain(|_, w| !w.is_empty());
    }

    fn create(
        &mut self,
        parent: &str,
        prefix: &str,
        mode: CreateMode,
        value: Bytes,
        session: SessionId,
    ) -> Result<String> {
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Error::NoNode(parent.to_string()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(Error::EphemeralParent(parent.to_string()));
        }

        let name = if mode.sequential {
            let seq = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{}{:0width$}", prefix, seq, width = SEQUENCE_WIDTH)
        } else {
            prefix.to_string()
        };

        let full = path::join(parent, &name);
        if self.nodes.contains_key(&full) {
            return Err(Error::NodeExists(full));
        }

        let txn = self.next_txn();
        let owner = mode.ephemeral.then_some(session);
        self.nodes.insert(full.clone(), Node::new(value, txn, owner));
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.insert(name);
        }

        self.fire(WatchTarget::value(full.clone()));
        self.fire(WatchTarget::children(parent));
        Ok(full)
    }

    fn remove(&mut self, node: &str) -> Result<()> {
        let existing = self
            .nodes
            .get(node)
            .ok_or_else(|| Error::NoNode(node.to_string()))?;
        if !existing.children.is_empty() {
            return Err(Error::NotEmpty(node.to_string()));
        }
        let parent = path::parent(node)
            .ok_or_else(|| Error::InvalidPath("cannot delete the root".into()))?
            .to_string();

        self.nodes.remove(node);
        self.next_txn();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.remove(path::name(node));
        }

        self.fire(WatchTarget::value(node));
        self.fire(WatchTarget::children(parent));
        Ok(())
    }

    fn expire(&mut self, client: ClientId) {
        let Some(slot) = self.clients.get(&client) else {
            return;
        };
        if matches!(slot.link, Link::Expired | Link::Closed) {
            return;
        }
        let session = slot.session;
        self.drop_watches(client);
        self.remove_ephemerals(session);
        if let Some(slot) = self.clients.get_mut(&client) {
            slot.link = Link::Expired;
            if !slot.partitioned {
                slot.notify(StoreEvent::Session(SessionEvent::Expired));
            }
        }
        tracing::debug!("Session {} of client {} expired", session, client);
    }

    fn remove_ephemerals(&mut self, session: SessionId) {
        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        // Deepest first so parents are empty when reached
        owned.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for node in owned {
            if let Err(e) = self.remove(&node) {
                tracing::warn!("Failed to remove ephemeral {} of session {}: {}", node, session, e);
            }
        }
    }
}

/// Shared in-process store
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
    session_timeout: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store containing only the root
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            session_timeout: None,
        }
    }

    /// Create a store that expires a session once its client has been
    /// partitioned for `timeout`
    pub fn with_session_timeout(timeout: Duration) -> Self {
        Self {
            session_timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Open a new client with a fresh session
    pub async fn connect(&self) -> MemoryClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tree = self.tree.lock().await;
        let id = tree.next_client;
        tree.next_client += 1;
        let session = tree.new_session();
        tree.clients.insert(
            id,
            ClientSlot {
                session,
                link: Link::Connected,
                partitioned: false,
                partitions: 0,
                events: tx,
            },
        );
        tracing::debug!("Client {} connected with session {}", id, session);

        MemoryClient {
            id,
            session: AtomicU64::new(session),
            tree: Arc::clone(&self.tree),
            events: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Cut a client off: its requests fail with `Disconnected` until healed
    /// and reconnected. Its ephemeral nodes survive unless the session
    /// timeout runs out first.
    pub async fn partition(&self, client: ClientId) {
        let mut tree = self.tree.lock().await;
        tree.drop_watches(client);
        let Some(slot) = tree.clients.get_mut(&client) else {
            return;
        };
        slot.partitioned = true;
        slot.partitions += 1;
        if slot.link == Link::Connected {
            slot.link = Link::Suspended;
            slot.notify(StoreEvent::Session(SessionEvent::Disconnected));
        }

        if let Some(timeout) = self.session_timeout {
            let partitions = slot.partitions;
            let tree = Arc::clone(&self.tree);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let mut tree = tree.lock().await;
                let still_cut_off = tree
                    .clients
                    .get(&client)
                    .is_some_and(|s| s.partitioned && s.partitions == partitions);
                if still_cut_off {
                    tracing::debug!("Client {} unreachable for {:?}", client, timeout);
                    tree.expire(client);
                }
            });
        }
    }

    /// Allow a partitioned client to reconnect
    pub async fn heal(&self, client: ClientId) {
        let mut tree = self.tree.lock().await;
        if let Some(slot) = tree.clients.get_mut(&client) {
            slot.partitioned = false;
        }
    }

    /// Declare a client's session dead, removing its ephemeral nodes
    pub async fn expire_session(&self, client: ClientId) {
        self.tree.lock().await.expire(client);
    }

    /// Whether a node exists (inspection helper)
    pub async fn exists(&self, node: &str) -> bool {
        self.tree.lock().await.nodes.contains_key(node)
    }

    /// Child names of a node (inspection helper, bypasses sessions)
    pub async fn peek_children(&self, node: &str) -> BTreeSet<String> {
        self.tree
            .lock()
            .await
            .nodes
            .get(node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }
}

/// A client connection to a [`MemoryStore`]
pub struct MemoryClient {
    id: ClientId,
    session: AtomicU64,
    tree: Arc<Mutex<Tree>>,
    events: std::sync::Mutex<Option<EventReceiver>>,
}

impl MemoryClient {
    /// Client handle used by the store's fault hooks
    pub fn id(&self) -> ClientId {
        self.id
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    fn session_id(&self) -> SessionId {
        self.session.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<EventReceiver> {
        match self.events.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    async fn ensure_path(&self, node: &str) -> Result<()> {
        path::validate(node)?;
        let mut tree = self.tree.lock().await;
        let session = tree.live_session(self.id)?;
        for ancestor in path::lineage(node) {
            if tree.nodes.contains_key(ancestor) {
                continue;
            }
            let parent = path::parent(ancestor).unwrap_or(path::ROOT);
            let name = path::name(ancestor);
            match tree.create(parent, name, CreateMode::PERSISTENT, Bytes::new(), session) {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_member(
        &self,
        parent: &str,
        prefix: &str,
        mode: CreateMode,
        value: Bytes,
    ) -> Result<String> {
        path::validate(parent)?;
        if prefix.contains('/') || (prefix.is_empty() && !mode.sequential) {
            return Err(Error::InvalidPath(format!("bad node name '{}'", prefix)));
        }
        let mut tree = self.tree.lock().await;
        let session = tree.live_session(self.id)?;
        tree.create(parent, prefix, mode, value, session)
    }

    async fn delete(&self, node: &str) -> Result<()> {
        path::validate(node)?;
        let mut tree = self.tree.lock().await;
        tree.live_session(self.id)?;
        tree.remove(node)
    }

    async fn children(&self, node: &str) -> Result<BTreeSet<String>> {
        let tree = self.tree.lock().await;
        tree.live_session(self.id)?;
        tree.nodes
            .get(node)
            .map(|n| n.children.clone())
            .ok_or_else(|| Error::NoNode(node.to_string()))
    }

    async fn get_value(&self, node: &str) -> Result<(Bytes, Stat)> {
        let tree = self.tree.lock().await;
        tree.live_session(self.id)?;
        tree.nodes
            .get(node)
            .map(|n| (n.value.clone(), n.stat()))
            .ok_or_else(|| Error::NoNode(node.to_string()))
    }

    async fn set_value(&self, node: &str, value: Bytes) -> Result<Stat> {
        let mut tree = self.tree.lock().await;
        tree.live_session(self.id)?;
        if !tree.nodes.contains_key(node) {
            return Err(Error::NoNode(node.to_string()));
        }
        let txn = tree.next_txn();
        let stat = match tree.nodes.get_mut(node) {
            Some(n) => {
                n.value = value;
                n.version += 1;
                n.modified_txn = txn;
                n.stat()
            }
            None => return Err(Error::NoNode(node.to_string())),
        };
        tree.fire(WatchTarget::value(node));
        Ok(stat)
    }

    async fn watch_children(&self, node: &str) -> Result<BTreeSet<String>> {
        let mut tree = self.tree.lock().await;
        tree.live_session(self.id)?;
        let children = tree
            .nodes
            .get(node)
            .map(|n| n.children.clone())
            .ok_or_else(|| Error::NoNode(node.to_string()))?;
        tree.child_watches
            .entry(node.to_string())
            .or_default()
            .insert(self.id);
        Ok(children)
    }

    async fn watch_value(&self, node: &str) -> Result<Option<(Bytes, Stat)>> {
        path::validate(node)?;
        let mut tree = self.tree.lock().await;
        tree.live_session(self.id)?;
        let current = tree.nodes.get(node).map(|n| (n.value.clone(), n.stat()));
        tree.value_watches
            .entry(node.to_string())
            .or_default()
            .insert(self.id);
        Ok(current)
    }

    async fn reconnect(&self) -> Result<Reconnected> {
        let mut tree = self.tree.lock().await;
        let (link, partitioned) = match tree.clients.get(&self.id) {
            Some(slot) => (slot.link, slot.partitioned),
            None => return Err(Error::ShuttingDown),
        };
        if link == Link::Closed {
            return Err(Error::ShuttingDown);
        }
        if partitioned {
            return Err(Error::Disconnected);
        }

        let renewed = link == Link::Expired;
        let session = if renewed {
            tree.new_session()
        } else {
            self.session_id()
        };
        if let Some(slot) = tree.clients.get_mut(&self.id) {
            slot.session = session;
            slot.link = Link::Connected;
        }
        self.session.store(session, Ordering::SeqCst);
        tracing::debug!(
            "Client {} reconnected (session {}, renewed: {})",
            self.id,
            session,
            renewed
        );

        Ok(Reconnected { session, renewed })
    }

    async fn close(&self) -> Result<()> {
        let mut tree = self.tree.lock().await;
        let Some(slot) = tree.clients.get(&self.id) else {
            return Ok(());
        };
        if slot.link == Link::Closed {
            return Ok(());
        }
        let session = slot.session;
        tree.drop_watches(self.id);
        tree.remove_ephemerals(session);
        if let Some(slot) = tree.clients.get_mut(&self.id) {
            slot.link = Link::Closed;
        }
        tracing::debug!("Client {} closed session {}", self.id, session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut EventReceiver) -> Vec<StoreEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn queue(client: &MemoryClient, prefix: &str) -> String {
        client
            .create_member("/locks", prefix, CreateMode::EPHEMERAL_SEQUENTIAL, Bytes::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_path_idempotent() {
        let store = MemoryStore::new();
        let client = store.connect().await;

        client.ensure_path("/app/locks").await.unwrap();
        client.ensure_path("/app/locks").await.unwrap();

        assert!(store.exists("/app").await);
        assert!(store.exists("/app/locks").await);
        assert_eq!(client.children("/app").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_suffixes_strictly_increase() {
        let store = MemoryStore::new();
        let a = store.connect().await;
        let b = store.connect().await;
        a.ensure_path("/locks").await.unwrap();

        let n0 = queue(&a, "a_").await;
        let n1 = queue(&b, "b_").await;
        a.delete(&n0).await.unwrap();
        let n2 = queue(&a, "a_").await;

        assert_eq!(n0, "/locks/a_0000000000");
        assert_eq!(n1, "/locks/b_0000000001");
        assert_eq!(n2, "/locks/a_0000000002");
    }

    #[tokio::test]
    async fn test_non_sequential_collision() {
        let store = MemoryStore::new();
        let client = store.connect().await;
        client.ensure_path("/nodes").await.unwrap();

        client.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
        let err = client
            .create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_and_non_empty() {
        let store = MemoryStore::new();
        let client = store.connect().await;
        client.ensure_path("/a/b").await.unwrap();

        assert!(matches!(client.delete("/a/missing").await, Err(Error::NoNode(_))));
        assert!(matches!(client.delete("/a").await, Err(Error::NotEmpty(_))));
        client.delete("/a/b").await.unwrap();
        client.delete("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_children_watch_fires_once() {
        let store = MemoryStore::new();
        let watcher = store.connect().await;
        let writer = store.connect().await;
        let mut events = watcher.take_events().unwrap();
        assert!(watcher.take_events().is_none());

        watcher.ensure_path("/nodes").await.unwrap();
        assert!(watcher.watch_children("/nodes").await.unwrap().is_empty());

        writer.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
        writer.create_member("/nodes", "n2", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

        assert_eq!(
            drain(&mut events),
            vec![StoreEvent::Watch(WatchTarget::children("/nodes"))]
        );

        // Re-armed: the next change is delivered again
        assert_eq!(watcher.watch_children("/nodes").await.unwrap().len(), 2);
        writer.create_member("/nodes", "n3", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
        assert_eq!(drain(&mut events).len(), 1);
    }

    #[tokio::test]
    async fn test_value_watch_and_versions() {
        let store = MemoryStore::new();
        let client = store.connect().await;
        let mut events = client.take_events().unwrap();

        assert!(client.watch_value("/data").await.unwrap().is_none());
        client.ensure_path("/data").await.unwrap();
        assert_eq!(drain(&mut events), vec![StoreEvent::Watch(WatchTarget::value("/data"))]);

        let (_, created) = client.watch_value("/data").await.unwrap().unwrap();
        let stat = client.set_value("/data", Bytes::from_static(b"v1")).await.unwrap();
        assert_eq!(stat.version, created.version + 1);
        assert!(stat.modified_txn > created.modified_txn);
        assert_eq!(drain(&mut events).len(), 1);

        let (value, _) = client.get_value("/data").await.unwrap();
        assert_eq!(value, Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn test_expire_removes_ephemerals_only() {
        let store = MemoryStore::new();
        let owner = store.connect().await;
        let observer = store.connect().await;
        let mut owner_events = owner.take_events().unwrap();
        let mut observer_events = observer.take_events().unwrap();

        owner.ensure_path("/nodes").await.unwrap();
        owner.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();
        owner.create_member("/nodes", "keep", CreateMode::PERSISTENT, Bytes::new()).await.unwrap();
        observer.watch_children("/nodes").await.unwrap();

        store.expire_session(owner.id()).await;

        assert_eq!(
            store.peek_children("/nodes").await.into_iter().collect::<Vec<_>>(),
            vec!["keep".to_string()]
        );
        assert_eq!(drain(&mut owner_events), vec![StoreEvent::Session(SessionEvent::Expired)]);
        assert_eq!(drain(&mut observer_events).len(), 1);

        assert!(matches!(owner.children("/nodes").await, Err(Error::SessionExpired)));
        let old_session = owner.session_id();
        let reconnected = owner.reconnect().await.unwrap();
        assert!(reconnected.renewed);
        assert_ne!(reconnected.session, old_session);
        assert!(owner.children("/nodes").await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let store = MemoryStore::new();
        let client = store.connect().await;
        let mut events = client.take_events().unwrap();
        client.ensure_path("/nodes").await.unwrap();
        client.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

        store.partition(client.id()).await;
        assert_eq!(drain(&mut events), vec![StoreEvent::Session(SessionEvent::Disconnected)]);
        assert!(matches!(client.children("/nodes").await, Err(Error::Disconnected)));
        assert!(matches!(client.reconnect().await, Err(Error::Disconnected)));

        store.heal(client.id()).await;
        let reconnected = client.reconnect().await.unwrap();
        assert!(!reconnected.renewed);
        assert!(store.exists("/nodes/n1").await);
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let store = MemoryStore::new();
        let client = store.connect().await;
        client.ensure_path("/nodes").await.unwrap();
        client.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

        let err = client
            .create_member("/nodes/n1", "child", CreateMode::PERSISTENT, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EphemeralParent(ref p) if p == "/nodes/n1"));
        assert!(matches!(
            client.ensure_path("/nodes/n1/deeper").await,
            Err(Error::EphemeralParent(_))
        ));

        // Expiry leaves nothing orphaned behind
        store.expire_session(client.id()).await;
        assert!(store.peek_children("/nodes").await.is_empty());
    }

    #[tokio::test]
    async fn test_session_timeout_expires_partitioned_client() {
        let store = MemoryStore::with_session_timeout(Duration::from_millis(20));
        let client = store.connect().await;
        let mut events = client.take_events().unwrap();
        client.ensure_path("/nodes").await.unwrap();
        client.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

        store.partition(client.id()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.exists("/nodes/n1").await);
        // Unreachable clients hear nothing about the expiry
        assert_eq!(drain(&mut events), vec![StoreEvent::Session(SessionEvent::Disconnected)]);

        store.heal(client.id()).await;
        assert!(client.reconnect().await.unwrap().renewed);
    }

    #[tokio::test]
    async fn test_healed_client_keeps_session_past_timeout() {
        let store = MemoryStore::with_session_timeout(Duration::from_millis(50));
        let client = store.connect().await;
        client.ensure_path("/nodes").await.unwrap();
        client.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

        store.partition(client.id()).await;
        store.heal(client.id()).await;
        assert!(!client.reconnect().await.unwrap().renewed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.exists("/nodes/n1").await);
        assert!(client.children("/nodes").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_deletes_ephemerals() {
        let store = MemoryStore::new();
        let client = store.connect().await;
        client.ensure_path("/nodes").await.unwrap();
        client.create_member("/nodes", "n1", CreateMode::EPHEMERAL, Bytes::new()).await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(!store.exists("/nodes/n1").await);
        assert!(store.exists("/nodes").await);
        assert!(matches!(client.children("/nodes").await, Err(Error::ShuttingDown)));
    }
}

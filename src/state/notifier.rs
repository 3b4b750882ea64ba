//! Change Notifier
//!
//! Watches a single persistent node and reports its value on every change.
//! The first callback after registration always reports the current value
//! (flagged `initial`), even when nothing was written; later callbacks are
//! reported only when the node's version actually moved.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::control::{CoordEvent, Participant, Snapshot};
use crate::error::Result;
use crate::store::{path, Stat, StoreClient, WatchTarget};

/// Change listener over one value node
pub struct ChangeNotifier {
    client: Arc<dyn StoreClient>,
    data_path: String,
    /// (created_txn, version) of the last reported value
    last: Option<(u64, u64)>,
    delivered: bool,
    active: bool,
}

impl ChangeNotifier {
    pub fn new(client: Arc<dyn StoreClient>, data_path: &str) -> Result<Self> {
        path::validate(data_path)?;
        Ok(Self {
            client,
            data_path: data_path.to_string(),
            last: None,
            delivered: false,
            active: true,
        })
    }

    /// Classify one observation of the node
    pub fn observe(&mut self, current: Option<&(Bytes, Stat)>, events: &mut Vec<CoordEvent>) {
        let path = self.data_path.clone();
        match current {
            Some((value, stat)) => {
                let key = (stat.created_txn, stat.version);
                let initial = !self.delivered;
                if !initial && self.last == Some(key) {
                    tracing::trace!("Spurious callback for {} at version {}", path, stat.version);
                    return;
                }
                tracing::info!(
                    "Change detected in {}: version {} ({} bytes)",
                    path,
                    stat.version,
                    value.len()
                );
                self.last = Some(key);
                self.delivered = true;
                events.push(CoordEvent::ValueChanged {
                    path,
                    value: value.clone(),
                    stat: stat.clone(),
                    initial,
                });
            }
            None => {
                if self.last.take().is_some() {
                    tracing::warn!("{} was deleted", path);
                    events.push(CoordEvent::ValueDeleted { path });
                }
                self.delivered = true;
            }
        }
    }
}

#[async_trait]
impl Participant for ChangeNotifier {
    fn path(&self) -> &str {
        &self.data_path
    }

    fn watches(&self) -> Vec<WatchTarget> {
        vec![WatchTarget::value(self.data_path.clone())]
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn start(&mut self, _events: &mut Vec<CoordEvent>) -> Result<()> {
        self.client.ensure_path(&self.data_path).await?;
        tracing::info!("Listening to changes of {}", self.data_path);
        Ok(())
    }

    async fn on_snapshot(
        &mut self,
        snapshot: &Snapshot,
        events: &mut Vec<CoordEvent>,
    ) -> Result<()> {
        if let Snapshot::Value { current, .. } = snapshot {
            self.observe(current.as_ref(), events);
        }
        Ok(())
    }

    async fn on_restored(&mut self, _renewed: bool, _events: &mut Vec<CoordEvent>) -> Result<()> {
        // The node is persistent; the fresh snapshot after the resync is
        // compared against the last reported version as usual
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }
}

/// Writer side of change data capture
pub struct ValuePublisher {
    client: Arc<dyn StoreClient>,
    data_path: String,
}

impl ValuePublisher {
    /// Create the data path if needed
    pub async fn new(client: Arc<dyn StoreClient>, data_path: &str) -> Result<Self> {
        client.ensure_path(data_path).await?;
        Ok(Self {
            client,
            data_path: data_path.to_string(),
        })
    }

    /// Overwrite the value, returning the new metadata
    pub async fn publish(&self, value: Bytes) -> Result<Stat> {
        let stat = self.client.set_value(&self.data_path, value).await?;
        tracing::info!("Updated {} to version {}", self.data_path, stat.version);
        Ok(stat)
    }
}

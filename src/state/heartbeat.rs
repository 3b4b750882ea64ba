//! Worker heartbeat
//!
//! A worker announces its liveness by holding one ephemeral node named by
//! its identity. The node vanishes with the worker's session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::control::{CoordEvent, Participant, Snapshot};
use crate::error::{Error, Result};
use crate::store::{path, CreateMode, StoreClient, WatchTarget};

/// Presence node for one worker
pub struct Heartbeat {
    client: Arc<dyn StoreClient>,
    heartbeat_path: String,
    identity: String,
    node: Option<String>,
    active: bool,
}

impl Heartbeat {
    pub fn new(client: Arc<dyn StoreClient>, heartbeat_path: &str, identity: &str) -> Result<Self> {
        path::validate(heartbeat_path)?;
        if identity.is_empty() || identity.contains('/') {
            return Err(Error::InvalidPath(format!("bad heartbeat identity '{}'", identity)));
        }
        Ok(Self {
            client,
            heartbeat_path: heartbeat_path.to_string(),
            identity: identity.to_string(),
            node: None,
            active: true,
        })
    }

    /// Full path of the presence node while registered
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    async fn register(&mut self) -> Result<()> {
        self.client.ensure_path(&self.heartbeat_path).await?;
        let node = self
            .client
            .create_member(
                &self.heartbeat_path,
                &self.identity,
                CreateMode::EPHEMERAL,
                Bytes::new(),
            )
            .await?;
        tracing::info!("Heartbeat registered for node {} at {}", self.identity, node);
        self.node = Some(node);
        Ok(())
    }
}

#[async_trait]
impl Participant for Heartbeat {
    fn path(&self) -> &str {
        &self.heartbeat_path
    }

    fn watches(&self) -> Vec<WatchTarget> {
        Vec::new()
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn start(&mut self, _events: &mut Vec<CoordEvent>) -> Result<()> {
        self.register().await
    }

    async fn on_snapshot(
        &mut self,
        _snapshot: &Snapshot,
        _events: &mut Vec<CoordEvent>,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_restored(&mut self, renewed: bool, _events: &mut Vec<CoordEvent>) -> Result<()> {
        if renewed && self.active {
            self.node = None;
            self.register().await?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.active = false;
        let Some(node) = self.node.take() else {
            return Ok(());
        };
        match self.client.delete(&node).await {
            Ok(()) | Err(Error::NoNode(_)) | Err(Error::SessionExpired) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

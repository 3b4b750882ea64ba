//! Crash Monitor
//!
//! Watches a heartbeat path where every worker keeps one ephemeral node.
//! A node that disappears means its session died: the monitor reports it
//! as lost. The monitor also registers itself under a monitors path so
//! operators can see who is watching.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::control::{CoordEvent, Participant, Snapshot};
use crate::error::Result;
use crate::state::{MemberHandle, MembershipDiffTracker, SequencedMembership, TrackerUpdate};
use crate::store::{path, StoreClient, WatchTarget};

/// Identity the monitor registers with
pub const MONITOR_IDENTITY: &str = "monitor";

/// Liveness monitor over one heartbeat path
pub struct CrashMonitor {
    client: Arc<dyn StoreClient>,
    heartbeat_path: String,
    tracker: MembershipDiffTracker,
    registration: Option<SequencedMembership>,
    handle: Option<MemberHandle>,
    active: bool,
}

impl CrashMonitor {
    pub fn new(client: Arc<dyn StoreClient>, heartbeat_path: &str) -> Result<Self> {
        path::validate(heartbeat_path)?;
        Ok(Self {
            client,
            heartbeat_path: heartbeat_path.to_string(),
            tracker: MembershipDiffTracker::new(),
            registration: None,
            handle: None,
            active: true,
        })
    }

    /// Also register as a sequential ephemeral member under `monitor_path`
    pub fn register_under(mut self, monitor_path: &str) -> Result<Self> {
        self.registration = Some(SequencedMembership::new(
            Arc::clone(&self.client),
            monitor_path,
            MONITOR_IDENTITY,
        )?);
        Ok(self)
    }

    /// Members currently considered alive
    pub fn tracker(&self) -> &MembershipDiffTracker {
        &self.tracker
    }

    /// Own registration node, if registered
    pub fn registration(&self) -> Option<&MemberHandle> {
        self.handle.as_ref()
    }

    async fn register(&mut self) -> Result<()> {
        if let Some(membership) = &self.registration {
            let handle = membership.join(Bytes::new()).await?;
            tracing::info!("Monitor registered as {}", handle.node());
            self.handle = Some(handle);
        }
        Ok(())
    }

    /// Classify a snapshot into liveness events
    pub fn observe(&mut self, children: &BTreeSet<String>, events: &mut Vec<CoordEvent>) {
        let path = self.heartbeat_path.clone();
        match self.tracker.apply(children) {
            TrackerUpdate::Resynced(members) => {
                tracing::info!(
                    "Found {} instances under {}. Monitoring started...",
                    members.len(),
                    path
                );
                events.push(CoordEvent::MembersResynced {
                    path,
                    members: members.into_iter().collect(),
                });
            }
            TrackerUpdate::Diff(diff) => {
                if diff.is_empty() {
                    tracing::trace!("No membership change under {}", path);
                    return;
                }
                for member in self.tracker.tracked() {
                    tracing::debug!("Node {} status: ONLINE", member);
                }
                for member in diff.joined {
                    tracing::info!("New instance found: {}", member);
                    events.push(CoordEvent::MemberDiscovered {
                        path: path.clone(),
                        member,
                    });
                }
                for member in diff.left {
                    tracing::warn!("Node {} is down", member);
                    events.push(CoordEvent::MemberLost {
                        path: path.clone(),
                        member,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Participant for CrashMonitor {
    fn path(&self) -> &str {
        &self.heartbeat_path
    }

    fn watches(&self) -> Vec<WatchTarget> {
        vec![WatchTarget::children(self.heartbeat_path.clone())]
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn start(&mut self, _events: &mut Vec<CoordEvent>) -> Result<()> {
        self.client.ensure_path(&self.heartbeat_path).await?;
        self.register().await
    }

    async fn on_snapshot(
        &mut self,
        snapshot: &Snapshot,
        events: &mut Vec<CoordEvent>,
    ) -> Result<()> {
        if let Snapshot::Children { children, .. } = snapshot {
            self.observe(children, events);
        }
        Ok(())
    }

    async fn on_restored(&mut self, renewed: bool, _events: &mut Vec<CoordEvent>) -> Result<()> {
        // Never diff against state from before the interruption
        self.tracker.reset();
        if renewed && self.registration.is_some() {
            self.handle = None;
            self.register().await?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.active = false;
        if let (Some(membership), Some(handle)) = (&self.registration, self.handle.take()) {
            membership.release(handle).await?;
        }
        Ok(())
    }
}

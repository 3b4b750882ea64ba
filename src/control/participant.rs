//! Participant seam between the control loop and the protocols

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;

use super::CoordEvent;
use crate::error::Result;
use crate::store::{Stat, WatchTarget};

/// State observed when a watch is (re-)armed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Children {
        path: String,
        children: BTreeSet<String>,
    },
    Value {
        path: String,
        current: Option<(Bytes, Stat)>,
    },
}

impl Snapshot {
    /// Watch that produced this snapshot
    pub fn target(&self) -> WatchTarget {
        match self {
            Snapshot::Children { path, .. } => WatchTarget::children(path.clone()),
            Snapshot::Value { path, .. } => WatchTarget::value(path.clone()),
        }
    }
}

/// A protocol instance driven by the control loop.
///
/// Every method runs on the control loop's task, one at a time, so
/// implementations own their state without locking.
#[async_trait]
pub trait Participant: Send {
    /// Namespace path the participant works under
    fn path(&self) -> &str;

    /// Watches that must stay armed while the participant is active
    fn watches(&self) -> Vec<WatchTarget>;

    /// False once released; inactive participants ignore every callback
    fn is_active(&self) -> bool;

    /// Create paths and member nodes
    async fn start(&mut self, events: &mut Vec<CoordEvent>) -> Result<()>;

    /// Handle fresh state from an armed watch
    async fn on_snapshot(
        &mut self,
        snapshot: &Snapshot,
        events: &mut Vec<CoordEvent>,
    ) -> Result<()>;

    /// The session was interrupted
    fn on_suspended(&mut self) {}

    /// The session is back. `renewed` means the old session expired and
    /// every ephemeral node it owned is gone.
    async fn on_restored(&mut self, renewed: bool, events: &mut Vec<CoordEvent>) -> Result<()>;

    /// Drop member nodes; further callbacks become no-ops
    async fn release(&mut self) -> Result<()>;

    /// Join again after a release
    async fn rejoin(&mut self, _events: &mut Vec<CoordEvent>) -> Result<()> {
        Ok(())
    }
}

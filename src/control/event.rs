//! Application-facing events
//!
//! Participants translate store snapshots into [`CoordEvent`]s; the control
//! loop hands each one to the application's [`EventHandler`], whose
//! [`Directive`] may release the participant that produced it.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::state::ElectionState;
use crate::store::Stat;

/// Event delivered to the application
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordEvent {
    /// Leader election role transition
    RoleChanged {
        path: String,
        identity: String,
        role: ElectionState,
        leader: String,
        members: Vec<String>,
    },
    /// This member now holds the lock
    LockAcquired { path: String, identity: String },
    /// This member is queued behind `position` others
    LockWaiting {
        path: String,
        identity: String,
        position: usize,
        holder: String,
    },
    /// A member appeared under a monitored path
    MemberDiscovered { path: String, member: String },
    /// A member disappeared from a monitored path (liveness alert)
    MemberLost { path: String, member: String },
    /// Tracked members were replaced wholesale by a fresh snapshot
    MembersResynced { path: String, members: Vec<String> },
    /// A watched value was observed
    ValueChanged {
        path: String,
        value: Bytes,
        stat: Stat,
        /// First observation after registration, not necessarily a write
        initial: bool,
    },
    /// A watched node was deleted
    ValueDeleted { path: String },
    /// The session is suspended; protocol progress stops until restored
    SessionSuspended,
    /// The session is live again
    SessionRestored {
        /// Ephemeral nodes were lost and recreated
        renewed: bool,
    },
}

impl CoordEvent {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            CoordEvent::RoleChanged { .. } => "role_changed",
            CoordEvent::LockAcquired { .. } => "lock_acquired",
            CoordEvent::LockWaiting { .. } => "lock_waiting",
            CoordEvent::MemberDiscovered { .. } => "member_discovered",
            CoordEvent::MemberLost { .. } => "member_lost",
            CoordEvent::MembersResynced { .. } => "members_resynced",
            CoordEvent::ValueChanged { .. } => "value_changed",
            CoordEvent::ValueDeleted { .. } => "value_deleted",
            CoordEvent::SessionSuspended => "session_suspended",
            CoordEvent::SessionRestored { .. } => "session_restored",
        }
    }
}

/// What the control loop should do with the participant after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Directive {
    /// Keep going
    #[default]
    Continue,
    /// Drop the member node; the participant stops
    Release,
    /// Drop the member node and join again at the back of the queue
    Requeue,
}

/// Application callback invoked sequentially by the control loop
#[async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: &CoordEvent) -> anyhow::Result<Directive>;
}

/// Forwards every event to a channel
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<CoordEvent>,
    on_acquired: Directive,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::UnboundedSender<CoordEvent>) -> Self {
        Self {
            tx,
            on_acquired: Directive::Continue,
        }
    }

    /// Directive returned when a lock is acquired
    pub fn on_acquired(mut self, directive: Directive) -> Self {
        self.on_acquired = directive;
        self
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&mut self, event: &CoordEvent) -> anyhow::Result<Directive> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))?;
        Ok(match event {
            CoordEvent::LockAcquired { .. } => self.on_acquired,
            _ => Directive::Continue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_handler_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handler = ChannelHandler::new(tx).on_acquired(Directive::Release);

        let acquired = CoordEvent::LockAcquired {
            path: "/locks".into(),
            identity: "a".into(),
        };
        assert_eq!(handler.handle(&acquired).await.unwrap(), Directive::Release);
        assert_eq!(
            handler.handle(&CoordEvent::SessionSuspended).await.unwrap(),
            Directive::Continue
        );

        assert_eq!(rx.recv().await.unwrap(), acquired);
        assert_eq!(rx.recv().await.unwrap().kind(), "session_suspended");
    }

    #[tokio::test]
    async fn test_channel_handler_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut handler = ChannelHandler::new(tx);
        assert!(handler.handle(&CoordEvent::SessionSuspended).await.is_err());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = CoordEvent::MemberLost {
            path: "/nodes".into(),
            member: "n2".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "member_lost");
        assert_eq!(json["member"], "n2");
    }
}

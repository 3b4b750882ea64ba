//! Leader Election and Mutual Exclusion
//!
//! Both policies share one mechanism: every candidate joins the namespace
//! as a sequential ephemeral member and, on every children callback,
//! recomputes the ordered sibling list. The member holding the minimal
//! suffix is the leader (or lock holder). Promotion relies solely on watch
//! callbacks; nothing polls.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::control::{CoordEvent, Participant, Snapshot};
use crate::error::{Error, Result};
use crate::state::{MemberHandle, Ranking, SequencedMembership};
use crate::store::{StoreClient, WatchTarget};

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionState {
    /// Joined, role not yet computed
    Candidate,
    /// Holds the minimal suffix
    Leader,
    /// Queued behind the leader
    Follower,
    /// Member node dropped; terminal for this instance
    Released,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Candidate => write!(f, "CANDIDATE"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Released => write!(f, "RELEASED"),
        }
    }
}

/// How the minimal member is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionPolicy {
    /// Minimal member is the leader; it keeps the role until released
    Leadership,
    /// Minimal member holds the lock; it must release when done
    Lock,
}

/// Election (or lock) participant
pub struct ElectionProtocol {
    membership: SequencedMembership,
    policy: ElectionPolicy,
    state: ElectionState,
    handle: Option<MemberHandle>,
}

impl ElectionProtocol {
    /// Leader election for `identity` under `namespace`
    pub fn leader_election(
        client: Arc<dyn StoreClient>,
        namespace: &str,
        identity: &str,
    ) -> Result<Self> {
        Self::new(client, namespace, identity, ElectionPolicy::Leadership)
    }

    /// Distributed lock for `identity` under `namespace`
    pub fn lock(client: Arc<dyn StoreClient>, namespace: &str, identity: &str) -> Result<Self> {
        Self::new(client, namespace, identity, ElectionPolicy::Lock)
    }

    pub fn new(
        client: Arc<dyn StoreClient>,
        namespace: &str,
        identity: &str,
        policy: ElectionPolicy,
    ) -> Result<Self> {
        Ok(Self {
            membership: SequencedMembership::new(client, namespace, identity)?,
            policy,
            state: ElectionState::Candidate,
            handle: None,
        })
    }

    /// Current state
    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn identity(&self) -> &str {
        self.membership.identity()
    }

    /// Member handle while joined
    pub fn handle(&self) -> Option<&MemberHandle> {
        self.handle.as_ref()
    }

    /// Join the namespace as a fresh candidate
    pub async fn join(&mut self) -> Result<()> {
        let handle = self.membership.join(Bytes::new()).await?;
        tracing::info!(
            "{} joined {} as {}",
            self.identity(),
            self.membership.namespace(),
            handle.name()
        );
        self.handle = Some(handle);
        self.state = ElectionState::Candidate;
        Ok(())
    }

    /// Recompute the role from a children snapshot. Returns the event to
    /// report when the role changed.
    pub fn evaluate(&mut self, children: &BTreeSet<String>) -> Result<Option<CoordEvent>> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(None);
        };
        let ranking = self.membership.rank(handle, children)?;
        self.log_roles(&ranking);

        let next = if ranking.is_leader() {
            ElectionState::Leader
        } else {
            ElectionState::Follower
        };

        let previous = self.state;
        match (previous, next) {
            (ElectionState::Leader, ElectionState::Follower) => {
                return Err(Error::ProtocolInvariant(format!(
                    "leader {} superseded by {} while its session is live",
                    handle.name(),
                    ranking.leader().name
                )));
            }
            (p, n) if p == n => return Ok(None),
            _ => {}
        }
        self.state = next;

        let path = self.membership.namespace().to_string();
        let identity = self.identity().to_string();
        let event = match self.policy {
            ElectionPolicy::Leadership => {
                if next == ElectionState::Leader {
                    tracing::info!("Node {} won the leader election", identity);
                }
                CoordEvent::RoleChanged {
                    path,
                    identity,
                    role: next,
                    leader: ranking.leader().identity.clone(),
                    members: ranking.members.iter().map(|m| m.name.clone()).collect(),
                }
            }
            ElectionPolicy::Lock if next == ElectionState::Leader => {
                tracing::info!("{} acquired lock {}", identity, path);
                CoordEvent::LockAcquired { path, identity }
            }
            ElectionPolicy::Lock => CoordEvent::LockWaiting {
                path,
                identity,
                position: ranking.position(),
                holder: ranking.leader().identity.clone(),
            },
        };
        Ok(Some(event))
    }

    fn log_roles(&self, ranking: &Ranking) {
        let leader = ranking.leader().sequence;
        for member in &ranking.members {
            let role = if member.sequence == leader {
                ElectionState::Leader
            } else {
                ElectionState::Follower
            };
            tracing::debug!("Node {}, Role: {}", member.name, role);
        }
    }

    /// Drop the member node. The handle is cleared before the delete so no
    /// callback can act on it afterwards.
    pub async fn release_member(&mut self) -> Result<()> {
        self.state = ElectionState::Released;
        match self.handle.take() {
            Some(handle) => {
                tracing::info!("{} releasing {}", self.identity(), handle.node());
                self.membership.release(handle).await
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Participant for ElectionProtocol {
    fn path(&self) -> &str {
        self.membership.namespace()
    }

    fn watches(&self) -> Vec<WatchTarget> {
        vec![WatchTarget::children(self.membership.namespace())]
    }

    fn is_active(&self) -> bool {
        self.state != ElectionState::Released
    }

    async fn start(&mut self, _events: &mut Vec<CoordEvent>) -> Result<()> {
        self.join().await
    }

    async fn on_snapshot(
        &mut self,
        snapshot: &Snapshot,
        events: &mut Vec<CoordEvent>,
    ) -> Result<()> {
        let Snapshot::Children { children, .. } = snapshot else {
            return Ok(());
        };
        if let Some(event) = self.evaluate(children)? {
            events.push(event);
        }
        Ok(())
    }

    fn on_suspended(&mut self) {
        if self.state == ElectionState::Leader {
            tracing::warn!(
                "{} is leader of {} but the session is suspended",
                self.identity(),
                self.membership.namespace()
            );
        }
    }

    async fn on_restored(&mut self, renewed: bool, _events: &mut Vec<CoordEvent>) -> Result<()> {
        if !renewed || self.state == ElectionState::Released {
            return Ok(());
        }
        // The store deleted our node with the old session
        self.handle = None;
        self.state = ElectionState::Candidate;
        self.join().await
    }

    async fn release(&mut self) -> Result<()> {
        self.release_member().await
    }

    async fn rejoin(&mut self, _events: &mut Vec<CoordEvent>) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.join().await
    }
}

//! Sequenced Membership
//!
//! A participant joins a namespace path as an ephemeral sequential node
//! named `{identity}_{suffix}`. The store-assigned suffix gives a total
//! order over siblings: lower suffix means earlier creation and higher
//! priority.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{path, CreateMode, StoreClient};

/// Separator between identity and sequence suffix in a member name
pub const MEMBER_SEPARATOR: char = '_';

/// One sibling, parsed from its node name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedMember {
    /// Store-assigned sequence suffix
    pub sequence: u64,
    /// Identity the member joined with
    pub identity: String,
    /// Raw child name
    pub name: String,
}

impl RankedMember {
    /// Parse `{identity}_{digits}`. The split happens at the last separator,
    /// so identities may themselves contain underscores.
    pub fn parse(name: &str) -> Option<Self> {
        let (identity, suffix) = name.rsplit_once(MEMBER_SEPARATOR)?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let sequence = suffix.parse().ok()?;
        Some(Self {
            sequence,
            identity: identity.to_string(),
            name: name.to_string(),
        })
    }
}

/// Node name prefix used when joining as `identity`
pub fn member_prefix(identity: &str) -> String {
    format!("{}{}", identity, MEMBER_SEPARATOR)
}

/// Proof of membership: the node this participant created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHandle {
    namespace: String,
    node: String,
    member: RankedMember,
}

impl MemberHandle {
    /// Full path of the member node
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Namespace the member joined
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Own sequence suffix
    pub fn sequence(&self) -> u64 {
        self.member.sequence
    }

    /// Own child name
    pub fn name(&self) -> &str {
        &self.member.name
    }
}

/// Total order of siblings at one observation instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    /// Own sequence suffix
    pub own: u64,
    /// Every parsed sibling, ascending by suffix
    pub members: Vec<RankedMember>,
}

impl Ranking {
    /// Order `children` and locate `own` among them.
    ///
    /// Fails with `ProtocolInvariant` if two names carry the same suffix or
    /// if `own` is not present: both mean the store broke its contract.
    pub fn from_children(own: u64, children: &BTreeSet<String>) -> Result<Self> {
        let mut members = Vec::with_capacity(children.len());
        for child in children {
            match RankedMember::parse(child) {
                Some(member) => members.push(member),
                None => tracing::warn!("Ignoring child '{}' without a sequence suffix", child),
            }
        }
        members.sort_by_key(|m| m.sequence);

        if let Some(pair) = members.windows(2).find(|w| w[0].sequence == w[1].sequence) {
            return Err(Error::ProtocolInvariant(format!(
                "members '{}' and '{}' share sequence {}",
                pair[0].name, pair[1].name, pair[0].sequence
            )));
        }
        if !members.iter().any(|m| m.sequence == own) {
            return Err(Error::ProtocolInvariant(format!(
                "own member with sequence {} missing from snapshot",
                own
            )));
        }

        Ok(Self { own, members })
    }

    /// Member with the globally minimal suffix
    pub fn leader(&self) -> &RankedMember {
        // from_children guarantees at least the own entry
        &self.members[0]
    }

    /// Whether the own member holds the minimal suffix
    pub fn is_leader(&self) -> bool {
        self.leader().sequence == self.own
    }

    /// Zero-based position of the own member
    pub fn position(&self) -> usize {
        self.members
            .iter()
            .position(|m| m.sequence == self.own)
            .unwrap_or(0)
    }
}

/// Membership of one identity in one sequential ephemeral group
pub struct SequencedMembership {
    client: Arc<dyn StoreClient>,
    namespace: String,
    identity: String,
}

impl SequencedMembership {
    /// Create a membership manager for `identity` under `namespace`
    pub fn new(client: Arc<dyn StoreClient>, namespace: &str, identity: &str) -> Result<Self> {
        path::validate(namespace)?;
        if identity.is_empty() || identity.contains('/') {
            return Err(Error::InvalidPath(format!("bad member identity '{}'", identity)));
        }
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        })
    }

    /// Namespace path
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Own identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Create the namespace if needed and join it as a new sequential
    /// ephemeral member
    pub async fn join(&self, value: Bytes) -> Result<MemberHandle> {
        self.client.ensure_path(&self.namespace).await?;
        let node = self
            .client
            .create_member(
                &self.namespace,
                &member_prefix(&self.identity),
                CreateMode::EPHEMERAL_SEQUENTIAL,
                value,
            )
            .await?;

        let member = RankedMember::parse(path::name(&node)).ok_or_else(|| {
            Error::ProtocolInvariant(format!("store returned unsequenced node {}", node))
        })?;
        tracing::debug!("Joined {} as {} (sequence {})", self.namespace, node, member.sequence);

        Ok(MemberHandle {
            namespace: self.namespace.clone(),
            node,
            member,
        })
    }

    /// Rank `handle` among the siblings in `children`
    pub fn rank(&self, handle: &MemberHandle, children: &BTreeSet<String>) -> Result<Ranking> {
        Ranking::from_children(handle.sequence(), children)
    }

    /// Delete the member node. Already-deleted nodes count as released, as
    /// do nodes whose session has expired (the store removed them).
    pub async fn release(&self, handle: MemberHandle) -> Result<()> {
        match self.client.delete(handle.node()).await {
            Ok(()) => {
                tracing::debug!("Released {}", handle.node());
                Ok(())
            }
            Err(Error::NoNode(_)) | Err(Error::SessionExpired) => {
                tracing::debug!("{} already gone", handle.node());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

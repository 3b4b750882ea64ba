//! Coordination Protocols
//!
//! Membership, election/locking, liveness monitoring and change
//! notification, all layered on the store's sequential ephemeral nodes and
//! single-fire watches.

mod membership;
mod tracker;

pub mod election;
pub mod heartbeat;
pub mod monitor;
pub mod notifier;

pub use election::{ElectionPolicy, ElectionProtocol, ElectionState};
pub use heartbeat::Heartbeat;
pub use membership::{member_prefix, MemberHandle, RankedMember, Ranking, SequencedMembership};
pub use monitor::CrashMonitor;
pub use notifier::{ChangeNotifier, ValuePublisher};
pub use tracker::{MembershipDiff, MembershipDiffTracker, TrackerUpdate};

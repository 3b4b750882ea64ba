//! CoordKit - Distributed Coordination Recipes
//!
//! Leader election, FIFO distributed locks, crash detection and change
//! data capture built on a ZooKeeper-style hierarchical store with
//! ephemeral nodes, sequential nodes and single-fire watches.
//!
//! # Architecture
//!
//! Every protocol is a [`control::Participant`] driven by one
//! [`control::ControlLoop`] per store session. Watch and session
//! notifications arrive on a single queue and are processed sequentially;
//! after each notification the loop re-arms the watch, fetches fresh
//! state, and hands the snapshot to the interested participants, which
//! emit [`control::CoordEvent`]s for the application.
//!
//! # Recipes
//!
//! - Leader election: lowest sequential suffix leads
//! - Distributed lock: FIFO hand-off in creation order
//! - Crash detection: ephemeral heartbeats diffed against the last snapshot
//! - Change data capture: value watch with version deduplication

pub mod config;
pub mod control;
pub mod error;
pub mod retry;
pub mod state;
pub mod store;

pub use config::CoordConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::CoordConfig;
    pub use crate::control::{
        ChannelHandler, ControlHandle, ControlLoop, CoordEvent, Directive, EventHandler,
        Participant,
    };
    pub use crate::error::{Error, Result};
    pub use crate::retry::RetryConfig;
    pub use crate::state::{
        ChangeNotifier, CrashMonitor, ElectionProtocol, ElectionState, Heartbeat, ValuePublisher,
    };
    pub use crate::store::{MemoryStore, StoreClient};
}

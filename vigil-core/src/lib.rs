//! Vigil core - the monitoring tree and its aggregation rules
//!
//! Every node of the mesh owns one [`Node`]: its own [`Host`] (probe results)
//! plus the snapshots reported by its children, keyed by their durable uuid.
//! This crate holds the pure tree operations:
//! - merging a child snapshot with cycle / duplicate pruning
//! - rolling statuses up the tree
//! - diffing two snapshots of the same subtree into [`Event`]s
//! - the UP/DOWN liveness sweep and depth truncation
//!
//! Locking, transport and delivery live in `vigil-kernel`.

mod aggregate;
mod diff;
mod event;
mod host;
mod node;
mod probe;
mod query;

pub use aggregate::{MergeOutcome, MergeRejection};
pub use diff::diff;
pub use event::{Event, StatusChange};
pub use host::Host;
pub use node::Node;
pub use probe::{
    ProbeResult, Severity, STATUS_CRITICAL, STATUS_DOWN, STATUS_ERROR, STATUS_OK, STATUS_WARNING,
};
pub use query::{GroupSummary, HostSummary};

/// Current unix timestamp in seconds, the unit of `Node::last_update`.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

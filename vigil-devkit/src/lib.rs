/*!
# Vigil DevKit - Test fixtures for the monitoring mesh

Shared by the unit and integration tests of the workspace:
- Tree builders (probed hosts, chains of relays)
- Throw-away authority key material
- Async helpers for waiting on eventually-consistent state
*/

pub mod fixtures;
pub mod harness;
pub mod keys;

pub use fixtures::{chain, node_with_probes};
pub use harness::{init_tracing, wait_until};

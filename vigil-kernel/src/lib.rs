//! Vigil kernel - everything a node runs around the core tree
//!
//! - [`mesh`]: the shared root and its event queue
//! - [`authority`], [`protocol`], [`push_server`], [`push_client`], [`tls`]:
//!   the authenticated push channel
//! - [`poller`], [`probes`], [`notifier`], [`http`]: thin adapters
//! - [`config`], [`identity`]: startup material

pub mod authority;
pub mod config;
pub mod http;
pub mod identity;
pub mod mesh;
pub mod notifier;
pub mod poller;
pub mod probes;
pub mod protocol;
pub mod push_client;
pub mod push_server;
pub mod tls;

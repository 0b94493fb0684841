use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::event::{Event, StatusChange};
use crate::host::Host;
use crate::probe::{ProbeResult, STATUS_DOWN};

fn default_alive() -> bool {
    true
}

/// One element of the monitoring tree.
///
/// The root is the local machine; every entry of `children` is the last
/// snapshot reported by a remote node, keyed by its uuid. `uuid` is the
/// durable identity, `hostname` is only a label and may repeat.
///
/// After every mutation `global_status` equals the maximum of the local
/// status and the children's global statuses (see [`Node::recompute_global_status`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_alive")]
    pub is_alive: bool,
    #[serde(default)]
    pub global_status: i32,
    #[serde(default)]
    pub global_message: String,
    pub local_host: Host,
    #[serde(default)]
    pub children: BTreeMap<String, Node>,
    /// Unix seconds of the last merge of this snapshot into its parent.
    #[serde(default)]
    pub last_update: i64,
    #[serde(skip)]
    pub disabled_probes: BTreeSet<String>,
}

impl Node {
    pub fn new(uuid: impl Into<String>, hostname: impl Into<String>, group: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let mut node = Self {
            uuid: uuid.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname.clone(),
            is_alive: true,
            global_status: 0,
            global_message: "OK".to_string(),
            local_host: Host::new(hostname, group),
            children: BTreeMap::new(),
            last_update: crate::unix_now(),
            disabled_probes: BTreeSet::new(),
        };
        node.recompute_global_status();
        node
    }

    /// Decodes a snapshot received from a peer, normalizes it and truncates
    /// it to `depth` levels (0 keeps everything).
    pub fn from_json(bytes: &[u8], depth: i32) -> serde_json::Result<Self> {
        let mut node: Node = serde_json::from_slice(bytes)?;
        node.normalize();
        node.erase_remote_nodes(depth);
        Ok(node)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Rebuilds derived state of a decoded snapshot: children keyed by their
    /// own uuid (entries without uuid are dropped), host statuses from their
    /// probes, missing hostnames from the host name, then the rollup.
    pub fn normalize(&mut self) {
        if self.hostname.is_empty() {
            self.hostname = self.local_host.name.clone();
        }
        self.local_host.recompute_status();

        let children = std::mem::take(&mut self.children);
        for (_, mut child) in children {
            if child.uuid.is_empty() {
                tracing::warn!(hostname = %child.hostname, "dropping child snapshot without uuid");
                continue;
            }
            child.normalize();
            self.children.insert(child.uuid.clone(), child);
        }
        self.recompute_global_status();
    }

    /// Status of this node alone; a node that stopped reporting is at least
    /// [`STATUS_DOWN`].
    pub fn local_status(&self) -> i32 {
        if self.is_alive {
            self.local_host.status
        } else {
            self.local_host.status.max(STATUS_DOWN)
        }
    }

    /// Recomputes `global_status` bottom-up over the whole subtree.
    pub fn recompute_global_status(&mut self) -> i32 {
        let mut status = self.local_status();
        for child in self.children.values_mut() {
            status = status.max(child.recompute_global_status());
        }
        self.global_status = status;
        status
    }

    /// Stores a fresh probe result on the local host.
    ///
    /// Emits `NewProbe` for an unknown name and `StatusChanged` when the
    /// status differs from the replaced result.
    pub fn submit_probe_result(&mut self, probe: ProbeResult) -> Vec<Event> {
        let hostname = self.hostname.clone();
        let name = probe.name.clone();
        let new_status = probe.status;
        let message = probe.message.clone();

        let previous = self.local_host.upsert_probe(probe.clone());
        self.recompute_global_status();

        match previous {
            None => vec![Event::NewProbe { hostname, probe }],
            Some(old) if old.status != new_status => vec![Event::StatusChanged(StatusChange {
                hostname,
                probe: Some(name),
                old_status: old.status,
                new_status,
                message,
                probes_in_error: self.local_host.probes_in_error(),
            })],
            Some(_) => Vec::new(),
        }
    }

    pub fn remove_probe(&mut self, name: &str) -> Option<Event> {
        let removed = self.local_host.remove_probe(name)?;
        self.recompute_global_status();
        Some(Event::RemovedProbe {
            hostname: self.hostname.clone(),
            probe: removed,
        })
    }

    /// Returns false if the probe was already disabled.
    pub fn disable_probe(&mut self, name: &str) -> bool {
        self.disabled_probes.insert(name.to_string())
    }

    pub fn is_probe_disabled(&self, name: &str) -> bool {
        self.disabled_probes.contains(name)
    }

    /// Flags the node as not reporting. Its last message stays visible.
    pub fn mark_down(&mut self) -> Event {
        self.is_alive = false;
        self.recompute_global_status();
        Event::NodeDown {
            uuid: self.uuid.clone(),
            hostname: self.hostname.clone(),
            last_message: self.global_message.clone(),
        }
    }

    pub fn mark_up(&mut self) -> Event {
        self.is_alive = true;
        self.recompute_global_status();
        Event::NodeUp {
            uuid: self.uuid.clone(),
            hostname: self.hostname.clone(),
        }
    }

    /// Drops the children of every node `depth` hops below this one and
    /// recomputes the rollup. `depth <= 0` leaves the tree untouched.
    pub fn erase_remote_nodes(&mut self, depth: i32) {
        if depth <= 0 {
            return;
        }
        self.truncate_below(depth);
        self.recompute_global_status();
    }

    fn truncate_below(&mut self, depth: i32) {
        for child in self.children.values_mut() {
            if depth == 1 {
                child.children.clear();
            } else {
                child.truncate_below(depth - 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::STATUS_OK;

    fn leaf(uuid: &str, status: i32) -> Node {
        let mut node = Node::new(uuid, uuid, "test");
        node.submit_probe_result(ProbeResult::new("check", status, 0, "msg"));
        node
    }

    #[test]
    fn test_status_rollup_takes_worst_descendant() {
        let mut grandchild = leaf("c", 350);
        grandchild.recompute_global_status();
        let mut child = leaf("b", 150);
        child.children.insert("c".into(), grandchild);
        let mut root = leaf("a", STATUS_OK);
        root.children.insert("b".into(), child);

        assert_eq!(root.recompute_global_status(), 350);
        assert_eq!(root.children["b"].global_status, 350);
        assert_eq!(root.local_status(), STATUS_OK);
    }

    #[test]
    fn test_erase_depth_one_keeps_direct_children() {
        let mut child = leaf("b", 120);
        child.children.insert("c".into(), leaf("c", 400));
        let mut root = leaf("a", STATUS_OK);
        root.children.insert("b".into(), child);
        root.recompute_global_status();
        assert_eq!(root.global_status, 400);

        root.erase_remote_nodes(1);
        assert!(root.children.contains_key("b"));
        assert!(root.children["b"].children.is_empty());
        assert_eq!(root.children["b"].global_status, 120);
        assert_eq!(root.global_status, 120);
    }

    #[test]
    fn test_erase_non_positive_depth_is_noop() {
        let mut child = leaf("b", 120);
        child.children.insert("c".into(), leaf("c", 400));
        let mut root = leaf("a", STATUS_OK);
        root.children.insert("b".into(), child);
        let before = root.clone();

        root.erase_remote_nodes(0);
        root.erase_remote_nodes(-3);
        assert_eq!(root, before);
    }

    #[test]
    fn test_submit_probe_events() {
        let mut node = Node::new("a", "host-a", "g");
        let events = node.submit_probe_result(ProbeResult::new("disk", 100, 0, "ok"));
        assert!(matches!(events.as_slice(), [Event::NewProbe { .. }]));

        let events = node.submit_probe_result(ProbeResult::new("disk", 100, 0, "still ok"));
        assert!(events.is_empty());

        let events = node.submit_probe_result(ProbeResult::new("disk", 300, 0, "full"));
        match events.as_slice() {
            [Event::StatusChanged(change)] => {
                assert_eq!(change.old_status, 100);
                assert_eq!(change.new_status, 300);
                assert_eq!(change.probes_in_error, vec!["disk".to_string()]);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(node.global_status, 300);

        assert!(node.remove_probe("disk").is_some());
        assert!(node.remove_probe("disk").is_none());
        assert_eq!(node.global_status, STATUS_OK);
    }

    #[test]
    fn test_down_node_keeps_message_and_reports_down_status() {
        let mut node = leaf("b", 120);
        node.global_message = "all good".into();
        match node.mark_down() {
            Event::NodeDown { last_message, .. } => assert_eq!(last_message, "all good"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(node.global_status, STATUS_DOWN);
        node.mark_up();
        assert_eq!(node.global_status, 120);
    }

    #[test]
    fn test_from_json_rekeys_children_and_recomputes() {
        let json = serde_json::json!({
            "uuid": "a",
            "local_host": {"name": "host-a", "probes": {}},
            "global_status": 999,
            "children": {
                "wrong-key": {
                    "uuid": "b",
                    "local_host": {"name": "host-b", "probes": {
                        "load": {"name": "load", "status": 250}
                    }},
                    "children": {}
                }
            }
        });
        let node = Node::from_json(json.to_string().as_bytes(), 0).unwrap();
        assert_eq!(node.hostname, "host-a");
        assert!(node.children.contains_key("b"));
        assert_eq!(node.children["b"].local_host.status, 250);
        assert_eq!(node.global_status, 250);
    }
}

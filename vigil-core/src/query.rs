use serde::{Deserialize, Serialize};

use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub name: String,
    pub uuid: String,
    pub group: String,
    pub status: i32,
    pub message: String,
    pub is_alive: bool,
    pub probes_in_error: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub name: String,
    /// Worst status among the group's hosts, 0 for an empty group.
    pub status: i32,
    pub hosts: Vec<HostSummary>,
}

impl HostSummary {
    fn of(node: &Node) -> Self {
        Self {
            name: node.hostname.clone(),
            uuid: node.uuid.clone(),
            group: node.local_host.group.clone(),
            status: node.global_status,
            message: node.global_message.clone(),
            is_alive: node.is_alive,
            probes_in_error: node.local_host.probes_in_error(),
        }
    }
}

// Read-only walks, pre-order from `self`.
impl Node {
    fn walk<'a>(&'a self, out: &mut Vec<&'a Node>) {
        out.push(self);
        for child in self.children.values() {
            child.walk(out);
        }
    }

    fn nodes(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.walk(&mut out);
        out
    }

    pub fn group_summary(&self, group: &str) -> GroupSummary {
        let hosts: Vec<HostSummary> = self
            .nodes()
            .into_iter()
            .filter(|n| n.local_host.group == group)
            .map(HostSummary::of)
            .collect();
        let status = hosts.iter().map(|h| h.status).max().unwrap_or(0);
        GroupSummary {
            name: group.to_string(),
            status,
            hosts,
        }
    }

    /// First node carrying `hostname`, the receiver included.
    pub fn find_by_hostname(&self, hostname: &str) -> Option<&Node> {
        self.nodes().into_iter().find(|n| n.hostname == hostname)
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<&Node> {
        self.nodes().into_iter().find(|n| n.uuid == uuid)
    }

    /// Uuids of all descendants, the receiver excluded.
    pub fn list_uuids(&self) -> Vec<String> {
        self.nodes()
            .into_iter()
            .skip(1)
            .map(|n| n.uuid.clone())
            .collect()
    }

    /// Hostnames of all descendants, the receiver excluded.
    pub fn list_hostnames(&self) -> Vec<String> {
        self.nodes()
            .into_iter()
            .skip(1)
            .map(|n| n.hostname.clone())
            .collect()
    }

    pub fn list_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for node in self.nodes() {
            let group = &node.local_host.group;
            if !group.is_empty() && !groups.contains(group) {
                groups.push(group.clone());
            }
        }
        groups
    }
}

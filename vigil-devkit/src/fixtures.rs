//! Tree builders.

use vigil_core::{Node, ProbeResult};

/// Node whose local host carries one probe per `(name, status)` pair.
pub fn node_with_probes(uuid: &str, hostname: &str, probes: &[(&str, i32)]) -> Node {
    let mut node = Node::new(uuid, hostname, "test");
    for (name, status) in probes {
        node.submit_probe_result(ProbeResult::new(*name, *status, 0, format!("{name} is {status}")));
    }
    node.recompute_global_status();
    node
}

/// Relay chain `first -> second -> ...`, each node the only child of the
/// previous one. Returns `None` for an empty list.
pub fn chain(links: &[(&str, &str)]) -> Option<Node> {
    links.iter().rev().fold(None, |below: Option<Node>, (uuid, hostname)| {
        let mut node = Node::new(*uuid, *hostname, "test");
        if let Some(child) = below {
            node.children.insert(child.uuid.clone(), child);
        }
        node.recompute_global_status();
        Some(node)
    })
}

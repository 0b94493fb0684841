use crate::event::{Event, StatusChange};
use crate::node::Node;

/// Compares two snapshots of the same subtree and returns the change events.
///
/// A node going down yields a single `NodeDown` and nothing for its subtree.
/// A node coming up yields `NodeUp` followed by its probe changes. A node
/// level `StatusChanged` is only raised when its global status moved and
/// nothing more precise was reported for that subtree.
pub fn diff(old: &Node, new: &Node) -> Vec<Event> {
    let mut events = Vec::new();
    diff_into(old, new, &mut events);
    events
}

fn diff_into(old: &Node, new: &Node, events: &mut Vec<Event>) {
    if old.is_alive && !new.is_alive {
        events.push(Event::NodeDown {
            uuid: new.uuid.clone(),
            hostname: new.hostname.clone(),
            last_message: new.global_message.clone(),
        });
        return;
    }

    let start = events.len();
    let came_up = !old.is_alive && new.is_alive;
    if came_up {
        events.push(Event::NodeUp {
            uuid: new.uuid.clone(),
            hostname: new.hostname.clone(),
        });
    }

    diff_probes(old, new, events);

    for (uuid, old_child) in &old.children {
        if let Some(new_child) = new.children.get(uuid) {
            diff_into(old_child, new_child, events);
        }
    }

    if !came_up && events.len() == start && old.global_status != new.global_status {
        events.push(Event::StatusChanged(StatusChange {
            hostname: new.hostname.clone(),
            probe: None,
            old_status: old.global_status,
            new_status: new.global_status,
            message: new.global_message.clone(),
            probes_in_error: new.local_host.probes_in_error(),
        }));
    }
}

fn diff_probes(old: &Node, new: &Node, events: &mut Vec<Event>) {
    let old_probes = &old.local_host.probes;
    let new_probes = &new.local_host.probes;

    for (name, old_probe) in old_probes {
        match new_probes.get(name) {
            Some(new_probe) if new_probe.status != old_probe.status => {
                events.push(Event::StatusChanged(StatusChange {
                    hostname: new.hostname.clone(),
                    probe: Some(name.clone()),
                    old_status: old_probe.status,
                    new_status: new_probe.status,
                    message: new_probe.message.clone(),
                    probes_in_error: new.local_host.probes_in_error(),
                }));
            }
            Some(_) => {}
            None if new.is_alive => events.push(Event::RemovedProbe {
                hostname: new.hostname.clone(),
                probe: old_probe.clone(),
            }),
            None => {}
        }
    }

    if !new.is_alive {
        return;
    }
    for (name, new_probe) in new_probes {
        if !old_probes.contains_key(name) {
            events.push(Event::NewProbe {
                hostname: new.hostname.clone(),
                probe: new_probe.clone(),
            });
        }
    }
}

use std::collections::BTreeSet;

use tracing::warn;

use crate::diff::diff;
use crate::event::Event;
use crate::node::Node;

/// Result of [`Node::merge_child`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Snapshot stored. `pruned` lists the uuids removed as duplicates.
    Merged { events: Vec<Event>, pruned: Vec<String> },
    Rejected(MergeRejection),
}

impl MergeOutcome {
    pub fn events(&self) -> &[Event] {
        match self {
            MergeOutcome::Merged { events, .. } => events,
            MergeOutcome::Rejected(_) => &[],
        }
    }

    pub fn into_events(self) -> Vec<Event> {
        match self {
            MergeOutcome::Merged { events, .. } => events,
            MergeOutcome::Rejected(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRejection {
    /// The snapshot carries the receiving node's own uuid.
    SelfReference,
    MissingUuid,
}

impl Node {
    /// Stores `incoming` as the child keyed by its uuid.
    ///
    /// Duplicate uuids anywhere in the resulting tree are pruned, the
    /// occurrence nearest to the root winning. On a tie the entries already
    /// present win over the newcomer's subtree. The returned events come from
    /// the diff between the previous snapshot of that child and the stored one.
    pub fn merge_child(&mut self, mut incoming: Node, now: i64) -> MergeOutcome {
        if incoming.uuid.is_empty() {
            warn!(hostname = %incoming.hostname, "discarding snapshot without uuid");
            return MergeOutcome::Rejected(MergeRejection::MissingUuid);
        }
        if incoming.uuid == self.uuid {
            warn!(hostname = %incoming.hostname, uuid = %incoming.uuid, "discarding snapshot carrying our own uuid");
            return MergeOutcome::Rejected(MergeRejection::SelfReference);
        }

        incoming.normalize();
        let uuid = incoming.uuid.clone();
        let previous = self.children.remove(&uuid);

        // A node marked down comes back through the liveness sweep.
        if previous.as_ref().is_some_and(|p| !p.is_alive) {
            incoming.is_alive = false;
        }
        incoming.last_update = now;
        self.children.insert(uuid.clone(), incoming);

        let pruned = self.prune_duplicates_favoring(Some(&uuid));
        self.recompute_global_status();

        let events = match (previous, self.children.get(&uuid)) {
            (Some(previous), Some(stored)) => diff(&previous, stored),
            _ => Vec::new(),
        };
        MergeOutcome::Merged { events, pruned }
    }

    /// Removes every node whose uuid already appeared closer to the root
    /// (the root itself included). Returns the removed uuids.
    pub fn prune_duplicates(&mut self) -> Vec<String> {
        self.prune_duplicates_favoring(None)
    }

    fn prune_duplicates_favoring(&mut self, newcomer: Option<&str>) -> Vec<String> {
        let mut seen = BTreeSet::from([self.uuid.clone()]);
        let mut doomed: Vec<Vec<String>> = Vec::new();
        let mut level: Vec<Vec<String>> = self.children.keys().map(|k| vec![k.clone()]).collect();

        while !level.is_empty() {
            if let Some(newcomer) = newcomer {
                level.sort_by_key(|path| path[0] == newcomer);
            }
            let mut next = Vec::new();
            for path in level {
                let Some(node) = self.descendant(&path) else {
                    continue;
                };
                if !seen.insert(node.uuid.clone()) {
                    doomed.push(path);
                    continue;
                }
                for key in node.children.keys() {
                    let mut child_path = path.clone();
                    child_path.push(key.clone());
                    next.push(child_path);
                }
            }
            level = next;
        }

        let mut pruned = Vec::new();
        for path in doomed {
            if let Some(node) = self.detach(&path) {
                warn!(
                    uuid = %node.uuid,
                    hostname = %node.hostname,
                    depth = path.len(),
                    "pruning duplicate node from tree"
                );
                pruned.push(node.uuid);
            }
        }
        pruned
    }

    fn descendant(&self, path: &[String]) -> Option<&Node> {
        path.iter().try_fold(self, |node, key| node.children.get(key))
    }

    fn detach(&mut self, path: &[String]) -> Option<Node> {
        let (last, parents) = path.split_last()?;
        let mut parent = self;
        for key in parents {
            parent = parent.children.get_mut(key)?;
        }
        parent.children.remove(last)
    }

    /// Liveness pass over the direct children.
    ///
    /// A child not merged for more than `alive_timeout` seconds goes down, a
    /// fresh child that was down comes back up. Each transition yields one event.
    pub fn sweep(&mut self, now: i64, alive_timeout: i64) -> Vec<Event> {
        let deadline = now - alive_timeout;
        let mut events = Vec::new();
        for child in self.children.values_mut() {
            let stale = child.last_update < deadline;
            if stale && child.is_alive {
                events.push(child.mark_down());
            } else if !stale && !child.is_alive {
                events.push(child.mark_up());
            }
        }
        if !events.is_empty() {
            self.recompute_global_status();
        }
        events
    }

    pub fn remove_child(&mut self, uuid: &str) -> Option<Node> {
        let removed = self.children.remove(uuid);
        if removed.is_some() {
            self.recompute_global_status();
        }
        removed
    }

    pub fn child_last_update(&self, uuid: &str) -> Option<i64> {
        self.children.get(uuid).map(|c| c.last_update)
    }
}

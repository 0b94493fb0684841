/**
 * MESH - Shared root of the monitoring tree
 *
 * ROLE: Single serialization point for every writer of the tree (pollers,
 * push handlers, probe runner, liveness sweep) and the producer side of the
 * notification queue.
 *
 * OPERATION:
 * - One reader/writer lock around the root `Node`, held for the whole mutation
 * - Events are computed under the lock and queued after it is released
 * - The queue is unbounded so a slow dispatcher never blocks a merge
 *
 * USAGE: cloned into every task at startup, no global registry.
 */

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vigil_core::{unix_now, Event, MergeOutcome, Node, ProbeResult};

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Clone)]
pub struct Mesh {
    root: Arc<RwLock<Node>>,
    events: mpsc::UnboundedSender<Event>,
    alive_timeout: i64,
}

impl Mesh {
    pub fn new(root: Node, alive_timeout: i64) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let mesh = Self {
            root: Arc::new(RwLock::new(root)),
            events,
            alive_timeout,
        };
        (mesh, rx)
    }

    pub fn uuid(&self) -> String {
        self.root.read().uuid.clone()
    }

    pub fn hostname(&self) -> String {
        self.root.read().hostname.clone()
    }

    pub fn alive_timeout(&self) -> i64 {
        self.alive_timeout
    }

    /// Queues an event for the dispatcher. Never blocks.
    pub fn notify(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("event queue closed, dropping event");
        }
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.notify(event);
        }
    }

    /// Merges a child snapshot received by a poller or a push handler.
    pub fn merge(&self, incoming: Node) -> MergeOutcome {
        let outcome = self.root.write().merge_child(incoming, unix_now());
        if let MergeOutcome::Merged { events, .. } = &outcome {
            self.publish(events.clone());
        }
        outcome
    }

    pub fn submit_probe_result(&self, probe: ProbeResult) {
        let events = self.root.write().submit_probe_result(probe);
        self.publish(events);
    }

    pub fn remove_probe(&self, name: &str) {
        let event = self.root.write().remove_probe(name);
        if let Some(event) = event {
            self.notify(event);
        }
    }

    pub fn disable_probe(&self, name: &str) -> bool {
        self.root.write().disable_probe(name)
    }

    pub fn is_probe_disabled(&self, name: &str) -> bool {
        self.root.read().is_probe_disabled(name)
    }

    /// One liveness pass at `now`. Returns the number of transitions.
    pub fn sweep_at(&self, now: i64) -> usize {
        let events = self.root.write().sweep(now, self.alive_timeout);
        let count = events.len();
        self.publish(events);
        count
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(unix_now())
    }

    /// Runs the liveness sweep every second until `cancel` fires.
    pub fn spawn_liveness_sweep(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mesh = self.clone();
        tokio::spawn(async move {
            info!(alive_timeout = mesh.alive_timeout, "starting liveness sweep");
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        mesh.sweep();
                    }
                }
            }
        })
    }

    /// Copy of the tree truncated to `depth` levels (0 keeps everything).
    pub fn serialize(&self, depth: i32) -> Node {
        let mut snapshot = self.root.read().clone();
        snapshot.erase_remote_nodes(depth);
        snapshot
    }

    pub fn snapshot_json(&self, depth: i32) -> serde_json::Result<String> {
        self.serialize(depth).to_json()
    }

    /// Runs a read-only query against the tree under the read lock.
    pub fn read<R>(&self, query: impl FnOnce(&Node) -> R) -> R {
        let root = self.root.read();
        query(&*root)
    }

    pub fn child_last_update(&self, uuid: &str) -> Option<i64> {
        self.root.read().child_last_update(uuid)
    }

    pub fn remove_child(&self, uuid: &str) -> Option<Node> {
        self.root.write().remove_child(uuid)
    }
}

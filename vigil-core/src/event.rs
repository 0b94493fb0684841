use serde::{Deserialize, Serialize};

use crate::probe::{ProbeResult, Severity};

/// Status transition of a probe (`probe` set) or of a whole node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub hostname: String,
    pub probe: Option<String>,
    pub old_status: i32,
    pub new_status: i32,
    pub message: String,
    /// Probes of the same host still in error, for context.
    #[serde(default)]
    pub probes_in_error: Vec<String>,
}

/// Change notification produced by the tree.
///
/// Events are only produced here; delivery belongs to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    NewProbe { hostname: String, probe: ProbeResult },
    RemovedProbe { hostname: String, probe: ProbeResult },
    StatusChanged(StatusChange),
    NodeUp { uuid: String, hostname: String },
    NodeDown { uuid: String, hostname: String, last_message: String },
    /// Free-form informational message (new push client, ...).
    Info { message: String },
}

impl Event {
    pub fn info(message: impl Into<String>) -> Self {
        Event::Info { message: message.into() }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Event::NewProbe { hostname, .. }
            | Event::RemovedProbe { hostname, .. }
            | Event::NodeUp { hostname, .. }
            | Event::NodeDown { hostname, .. } => Some(hostname),
            Event::StatusChanged(change) => Some(&change.hostname),
            Event::Info { .. } => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::NewProbe { probe, .. } => probe.severity(),
            Event::RemovedProbe { .. } | Event::NodeUp { .. } | Event::Info { .. } => Severity::Info,
            Event::StatusChanged(change) => Severity::from_status(change.new_status),
            Event::NodeDown { .. } => Severity::Critical,
        }
    }

    /// One line description, used as log line and mail subject.
    pub fn message(&self) -> String {
        match self {
            Event::NewProbe { hostname, probe } => format!(
                "New probe {} with status {} detected on host {}",
                probe.name, probe.status, hostname
            ),
            Event::RemovedProbe { hostname, probe } => format!(
                "Probe {} on host {} does not exist anymore. Last status was {}",
                probe.name, hostname, probe.status
            ),
            Event::StatusChanged(change) => match &change.probe {
                Some(probe) => format!(
                    "Probe {} status changed from {} to {} on host {}",
                    probe, change.old_status, change.new_status, change.hostname
                ),
                None => format!(
                    "Host {} status changed from {} to {}",
                    change.hostname, change.old_status, change.new_status
                ),
            },
            Event::NodeUp { hostname, .. } => format!("Host {hostname} UP"),
            Event::NodeDown { hostname, .. } => format!("Host {hostname} DOWN"),
            Event::Info { message } => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = Event::NodeDown {
            uuid: "u-1".into(),
            hostname: "db-1".into(),
            last_message: "OK".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "NodeDown");
        assert_eq!(json["hostname"], "db-1");
        assert_eq!(event.message(), "Host db-1 DOWN");
    }
}

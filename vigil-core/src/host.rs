use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::probe::{ProbeResult, STATUS_OK};

/// Probe collection of one machine.
///
/// `status` is the worst probe status and is recomputed on every change of
/// `probes`. A host with no probe is OK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub probes: BTreeMap<String, ProbeResult>,
}

impl Host {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            status: STATUS_OK,
            probes: BTreeMap::new(),
        }
    }

    /// Stores `probe` under its name and returns the result it replaced.
    pub fn upsert_probe(&mut self, probe: ProbeResult) -> Option<ProbeResult> {
        let previous = self.probes.insert(probe.name.clone(), probe);
        self.recompute_status();
        previous
    }

    pub fn remove_probe(&mut self, name: &str) -> Option<ProbeResult> {
        let removed = self.probes.remove(name);
        if removed.is_some() {
            self.recompute_status();
        }
        removed
    }

    pub fn recompute_status(&mut self) -> i32 {
        self.status = self
            .probes
            .values()
            .map(|p| p.status)
            .max()
            .unwrap_or(STATUS_OK);
        self.status
    }

    /// Names of the probes currently at warning level or above.
    pub fn probes_in_error(&self) -> Vec<String> {
        self.probes
            .values()
            .filter(|p| p.is_error())
            .map(|p| p.name.clone())
            .collect()
    }
}

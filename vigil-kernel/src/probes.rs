//! Local probe runner
//!
//! Probes live in subdirectories of the probes directory named by their
//! interval in seconds (`60/check_disk`). Each run is a child process whose
//! stdout is a JSON document (`status`, `message`, `value`, `metrics`,
//! `detail`). Exit code 13 means "not applicable here" and disables the probe.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{ProbeResult, STATUS_ERROR};

use crate::mesh::Mesh;

pub const DISABLE_EXIT_CODE: i32 = 13;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    status: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    metrics: Option<serde_json::Value>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Result(ProbeResult),
    Disable,
}

fn failure(name: &str, exit_code: i32, message: impl Into<String>, detail: &str) -> ProbeOutcome {
    ProbeOutcome::Result(ProbeResult::new(name, STATUS_ERROR, exit_code, message).with_detail(detail))
}

/// Runs one probe executable with a deadline.
pub async fn execute(path: &Path, timeout: Duration) -> ProbeOutcome {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let child = Command::new(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return failure(&name, -1, format!("cannot start probe: {e}"), ""),
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => {
            warn!(probe = %name, "probe timed out, killed");
            return failure(&name, -1, "Probe timeout", "");
        }
        Ok(Err(e)) => return failure(&name, -1, format!("error waiting for probe: {e}"), ""),
        Ok(Ok(output)) => output,
    };

    let exit_code = output.status.code().unwrap_or(-1);
    if exit_code == DISABLE_EXIT_CODE {
        return ProbeOutcome::Disable;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return failure(&name, exit_code, format!("error: {}", output.status), &format!("{stdout}{stderr}"));
    }

    match serde_json::from_str::<ProbeOutput>(stdout.trim()) {
        Ok(parsed) => {
            let mut result = ProbeResult::new(&name, parsed.status, exit_code, parsed.message);
            result.value = parsed.value;
            result.metrics = parsed.metrics;
            result.detail = parsed.detail;
            ProbeOutcome::Result(result)
        }
        Err(e) => failure(&name, exit_code, format!("invalid probe output: {e}"), &stdout),
    }
}

pub struct ProbeRunner {
    directory: PathBuf,
    timeout: Duration,
    mesh: Mesh,
}

impl ProbeRunner {
    pub fn new(directory: impl Into<PathBuf>, timeout: Duration, mesh: Mesh) -> Self {
        Self {
            directory: directory.into(),
            timeout,
            mesh,
        }
    }

    /// Interval subdirectories of the probes directory.
    pub async fn discover(&self) -> std::io::Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_string_lossy().parse::<u64>() {
                Ok(interval) if interval > 0 => found.push((interval, entry.path())),
                _ => debug!(dir = %entry.path().display(), "ignoring non interval directory"),
            }
        }
        found.sort();
        Ok(found)
    }

    async fn list_probes(dir: &Path) -> std::io::Result<BTreeSet<PathBuf>> {
        let mut probes = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                probes.insert(entry.path());
            }
        }
        Ok(probes)
    }

    /// One pass over `dir`: runs every enabled probe, then drops results of
    /// probes that vanished since `known`. Returns the probe names found.
    pub async fn run_directory(&self, dir: &Path, known: &BTreeSet<String>) -> BTreeSet<String> {
        let probes = match Self::list_probes(dir).await {
            Ok(probes) => probes,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list probes");
                return known.clone();
            }
        };

        let mut seen = BTreeSet::new();
        for path in probes {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            seen.insert(name.clone());
            if self.mesh.is_probe_disabled(&name) {
                continue;
            }
            match execute(&path, self.timeout).await {
                ProbeOutcome::Result(result) => {
                    debug!(probe = %name, status = result.status, "probe result");
                    self.mesh.submit_probe_result(result);
                }
                ProbeOutcome::Disable => {
                    info!(probe = %name, "probe asked to be disabled");
                    self.mesh.disable_probe(&name);
                    self.mesh.remove_probe(&name);
                }
            }
        }

        for gone in known.difference(&seen) {
            info!(probe = %gone, "probe removed from disk");
            self.mesh.remove_probe(gone);
        }
        seen
    }

    /// One task per interval directory.
    pub async fn spawn(self, cancel: CancellationToken) -> std::io::Result<Vec<JoinHandle<()>>> {
        let directories = self.discover().await?;
        info!(dir = %self.directory.display(), directories = directories.len(), "starting probe runner");
        let runner = std::sync::Arc::new(self);

        Ok(directories
            .into_iter()
            .map(|(interval, dir)| {
                let runner = runner.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                    let mut known = BTreeSet::new();
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                known = runner.run_directory(&dir, &known).await;
                            }
                        }
                    }
                })
            })
            .collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use vigil_core::Node;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_json_output_becomes_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "disk", r#"echo '{"status":250,"message":"/var 91%","value":91}'"#);
        match execute(&path, Duration::from_secs(5)).await {
            ProbeOutcome::Result(result) => {
                assert_eq!(result.name, "disk");
                assert_eq!(result.status, 250);
                assert_eq!(result.value, Some(serde_json::json!(91)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failures_map_to_error_status() {
        let dir = tempfile::tempdir().unwrap();

        let crash = script(dir.path(), "crash", "echo boom >&2; exit 2");
        let ProbeOutcome::Result(result) = execute(&crash, Duration::from_secs(5)).await else {
            panic!("expected a result");
        };
        assert_eq!((result.status, result.exit_code), (STATUS_ERROR, 2));

        let garbage = script(dir.path(), "garbage", "echo not-json");
        let ProbeOutcome::Result(result) = execute(&garbage, Duration::from_secs(5)).await else {
            panic!("expected a result");
        };
        assert_eq!(result.status, STATUS_ERROR);

        let slow = script(dir.path(), "slow", "sleep 5");
        let ProbeOutcome::Result(result) = execute(&slow, Duration::from_millis(200)).await else {
            panic!("expected a result");
        };
        assert_eq!((result.status, result.exit_code), (STATUS_ERROR, -1));

        let off = script(dir.path(), "off", "exit 13");
        assert_eq!(execute(&off, Duration::from_secs(5)).await, ProbeOutcome::Disable);
    }

    #[tokio::test]
    async fn test_directory_pass_tracks_disable_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let interval_dir = dir.path().join("60");
        std::fs::create_dir(&interval_dir).unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        script(&interval_dir, "ok", r#"echo '{"status":100,"message":"fine"}'"#);
        script(&interval_dir, "off", "exit 13");

        let (mesh, _rx) = Mesh::new(Node::new("root", "host", "g"), 60);
        let runner = ProbeRunner::new(dir.path(), Duration::from_secs(5), mesh.clone());
        let found = runner.discover().await.unwrap();
        assert_eq!(found, vec![(60, interval_dir.clone())]);

        let known = runner.run_directory(&interval_dir, &BTreeSet::new()).await;
        assert_eq!(known.len(), 2);
        assert!(mesh.is_probe_disabled("off"));
        assert!(mesh.read(|root| root.local_host.probes.contains_key("ok")));

        std::fs::remove_file(interval_dir.join("ok")).unwrap();
        runner.run_directory(&interval_dir, &known).await;
        assert!(mesh.read(|root| root.local_host.probes.is_empty()));
    }
}

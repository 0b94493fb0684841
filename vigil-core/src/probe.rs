use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Everything fine.
pub const STATUS_OK: i32 = 100;
/// Lower bound of the warning band (200-299).
pub const STATUS_WARNING: i32 = 200;
/// Lower bound of the critical band (300-499).
pub const STATUS_CRITICAL: i32 = 300;
/// Status given to a child that stopped reporting.
pub const STATUS_DOWN: i32 = 499;
/// Probe could not be executed or its output could not be read.
pub const STATUS_ERROR: i32 = 500;

/// Band of a status integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Critical,
    Error,
}

impl Severity {
    pub fn from_status(status: i32) -> Self {
        match status {
            i32::MIN..=100 => Severity::Ok,
            101..=199 => Severity::Info,
            200..=299 => Severity::Warning,
            300..=499 => Severity::Critical,
            _ => Severity::Error,
        }
    }
}

/// Outcome of one probe execution.
///
/// A result is never edited in place: a new run produces a new value which
/// replaces the previous one under the same name in [`crate::Host::probes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub status: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub probe_date: OffsetDateTime,
}

impl ProbeResult {
    pub fn new(name: impl Into<String>, status: i32, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            value: None,
            metrics: None,
            detail: None,
            exit_code,
            probe_date: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(serde_json::Value::String(detail));
        }
        self
    }

    pub fn severity(&self) -> Severity {
        Severity::from_status(self.status)
    }

    /// Warning and above.
    pub fn is_error(&self) -> bool {
        self.status >= STATUS_WARNING
    }
}

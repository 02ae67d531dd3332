pub mod reachability;
pub mod session;

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    TcpReachability,
    Ping,
    CredentialedSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    AuthFailed,
    Unreachable,
    Timeout,
    Error,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AuthFailed => "auth_failed",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// One bounded probe attempt against one device.
///
/// Built only through the constructors below, which keep `latency_ms` empty
/// for every outcome that did not complete a round trip.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub device_id: String,
    pub timestamp_unix: i64,
    pub kind: ProbeKind,
    pub outcome: ProbeOutcome,
    pub latency_ms: Option<f64>,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandReport>,
}

/// The diagnostic command run after login, timed apart from the session itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub duration_ms: f64,
    pub uptime: Option<String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(device_id: &str, kind: ProbeKind, latency: Duration, detail: String) -> Self {
        Self::completed(device_id, kind, ProbeOutcome::Success, latency, detail)
    }

    /// The device answered but rejected the credentials.
    pub fn auth_failed(device_id: &str, kind: ProbeKind, latency: Duration, detail: String) -> Self {
        Self::completed(device_id, kind, ProbeOutcome::AuthFailed, latency, detail)
    }

    pub fn unreachable(device_id: &str, kind: ProbeKind, detail: String) -> Self {
        Self::failed(device_id, kind, ProbeOutcome::Unreachable, detail)
    }

    pub fn timeout(device_id: &str, kind: ProbeKind, detail: String) -> Self {
        Self::failed(device_id, kind, ProbeOutcome::Timeout, detail)
    }

    pub fn error(device_id: &str, kind: ProbeKind, detail: String) -> Self {
        Self::failed(device_id, kind, ProbeOutcome::Error, detail)
    }

    pub fn with_command(mut self, report: CommandReport) -> Self {
        self.command = Some(report);
        self
    }

    fn completed(
        device_id: &str,
        kind: ProbeKind,
        outcome: ProbeOutcome,
        latency: Duration,
        detail: String,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp_unix: now_unix(),
            kind,
            outcome,
            latency_ms: Some(duration_ms(latency)),
            detail,
            command: None,
        }
    }

    fn failed(device_id: &str, kind: ProbeKind, outcome: ProbeOutcome, detail: String) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp_unix: now_unix(),
            kind,
            outcome,
            latency_ms: None,
            detail,
            command: None,
        }
    }
}

pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Cuts `text` to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}

/// First line of diagnostic output that reports uptime.
///
/// Covers `uptime is` (IOS), `Uptime:` (EOS), and `System booted:` or `up N days` (Junos).
pub fn extract_uptime(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            lower.contains("uptime is")
                || lower.starts_with("uptime:")
                || lower.starts_with("system booted:")
                || lower.contains(" up ")
        })
        .map(str::to_string)
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

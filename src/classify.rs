use crate::config::Thresholds;
use crate::probe::{ProbeOutcome, ProbeResult};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 4] = [
        DeviceStatus::Online,
        DeviceStatus::Offline,
        DeviceStatus::Degraded,
        DeviceStatus::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyTier {
    Normal,
    High,
    Critical,
}

pub fn classify(result: Option<&ProbeResult>, thresholds: &Thresholds) -> DeviceStatus {
    let Some(result) = result else {
        return DeviceStatus::Unknown;
    };
    match result.outcome {
        ProbeOutcome::Unreachable | ProbeOutcome::Timeout | ProbeOutcome::Error => {
            DeviceStatus::Offline
        }
        ProbeOutcome::AuthFailed => DeviceStatus::Degraded,
        ProbeOutcome::Success => match result.latency_ms {
            Some(ms) if latency_tier(ms, thresholds) != LatencyTier::Normal => {
                DeviceStatus::Degraded
            }
            _ => DeviceStatus::Online,
        },
    }
}

pub fn latency_tier(latency_ms: f64, thresholds: &Thresholds) -> LatencyTier {
    if latency_ms > thresholds.latency_critical_ms {
        LatencyTier::Critical
    } else if latency_ms > thresholds.latency_degraded_ms {
        LatencyTier::High
    } else {
        LatencyTier::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeKind;
    use std::time::Duration;

    fn ok_with(ms: u64) -> ProbeResult {
        ProbeResult::success(
            "r1",
            ProbeKind::TcpReachability,
            Duration::from_millis(ms),
            String::new(),
        )
    }

    #[test]
    fn failures_are_offline() {
        let th = Thresholds::default();
        for result in [
            ProbeResult::unreachable("r1", ProbeKind::TcpReachability, "refused".into()),
            ProbeResult::timeout("r1", ProbeKind::CredentialedSession, "slow".into()),
            ProbeResult::error("r1", ProbeKind::Ping, "denied".into()),
        ] {
            assert_eq!(classify(Some(&result), &th), DeviceStatus::Offline);
        }
    }

    #[test]
    fn auth_failure_is_degraded_not_offline() {
        let result = ProbeResult::auth_failed(
            "r1",
            ProbeKind::CredentialedSession,
            Duration::from_millis(20),
            "rejected".into(),
        );
        assert_eq!(
            classify(Some(&result), &Thresholds::default()),
            DeviceStatus::Degraded
        );
    }

    #[test]
    fn latency_threshold_splits_online_and_degraded() {
        let th = Thresholds::default();
        assert_eq!(classify(Some(&ok_with(40)), &th), DeviceStatus::Online);
        assert_eq!(classify(Some(&ok_with(500)), &th), DeviceStatus::Online);
        assert_eq!(classify(Some(&ok_with(501)), &th), DeviceStatus::Degraded);
        assert_eq!(classify(Some(&ok_with(2500)), &th), DeviceStatus::Degraded);
        assert_eq!(latency_tier(2500.0, &th), LatencyTier::Critical);
        assert_eq!(latency_tier(800.0, &th), LatencyTier::High);
    }

    #[test]
    fn never_probed_is_unknown() {
        assert_eq!(classify(None, &Thresholds::default()), DeviceStatus::Unknown);
    }

    #[test]
    fn classification_is_deterministic() {
        let th = Thresholds {
            latency_degraded_ms: 30.0,
            latency_critical_ms: 60.0,
        };
        let result = ok_with(45);
        let first = classify(Some(&result), &th);
        for _ in 0..10 {
            assert_eq!(classify(Some(&result), &th), first);
        }
        assert_eq!(first, DeviceStatus::Degraded);
    }
}

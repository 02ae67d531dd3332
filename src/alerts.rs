use crate::classify::DeviceStatus;
use crate::config::AlertsConfig;
use crate::snapshot::FleetSnapshot;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertTrackState {
    pub consecutive_failures: u32,
    pub is_down: bool,
    pub last_alert_sent_at: Option<i64>,
    pub last_state_change_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEventKind {
    Down,
    Repeat,
    Recovered,
}

impl AlertEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Repeat => "repeat",
            Self::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub device_id: String,
    pub kind: AlertEventKind,
    pub detail: String,
}

/// Turns consecutive offline passes into down/repeat/recovered transitions.
#[derive(Debug, Clone, Default)]
pub struct AlertTracker {
    cfg: AlertsConfig,
    tracking: HashMap<String, AlertTrackState>,
}

impl AlertTracker {
    pub fn new(cfg: AlertsConfig) -> Self {
        Self {
            cfg,
            tracking: HashMap::new(),
        }
    }

    pub fn state(&self, device_id: &str) -> Option<&AlertTrackState> {
        self.tracking.get(device_id)
    }

    pub fn apply(&mut self, snapshot: &FleetSnapshot, now_unix: i64) -> Vec<AlertEvent> {
        // devices dropped from the inventory stop being tracked
        self.tracking
            .retain(|id, _| snapshot.per_device.contains_key(id));

        let mut events = Vec::new();
        for (id, entry) in &snapshot.per_device {
            let is_up = match entry.status {
                DeviceStatus::Unknown => continue,
                DeviceStatus::Offline => false,
                DeviceStatus::Online | DeviceStatus::Degraded => true,
            };
            if let Some(kind) = self.update(id, is_up, now_unix) {
                events.push(AlertEvent {
                    device_id: id.clone(),
                    kind,
                    detail: entry.detail.clone(),
                });
            }
        }
        events
    }

    fn update(&mut self, device_id: &str, is_up: bool, now_unix: i64) -> Option<AlertEventKind> {
        let cfg = &self.cfg;
        let entry = self.tracking.entry(device_id.to_string()).or_default();

        if is_up {
            let was_down = entry.is_down;
            entry.consecutive_failures = 0;
            entry.is_down = false;
            if was_down {
                entry.last_state_change_at = Some(now_unix);
                if cfg.recovery_notify {
                    return Some(AlertEventKind::Recovered);
                }
            }
            return None;
        }

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        if !entry.is_down && entry.consecutive_failures >= cfg.fail_threshold {
            entry.is_down = true;
            entry.last_state_change_at = Some(now_unix);
            entry.last_alert_sent_at = Some(now_unix);
            return Some(AlertEventKind::Down);
        }

        if entry.is_down {
            let due = match entry.last_alert_sent_at {
                Some(last_sent) => now_unix - last_sent >= cfg.repeat_interval_secs as i64,
                None => true,
            };
            if due {
                entry.last_alert_sent_at = Some(now_unix);
                return Some(AlertEventKind::Repeat);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::inventory::DeviceClass;
    use crate::probe::{ProbeKind, ProbeResult};
    use crate::snapshot::{DeviceEntry, SnapshotSource};
    use std::time::Duration;

    fn alerts_cfg() -> AlertsConfig {
        AlertsConfig {
            fail_threshold: 3,
            repeat_interval_secs: 1800,
            recovery_notify: true,
        }
    }

    fn snapshot_with(id: &str, up: bool) -> FleetSnapshot {
        let result = if up {
            ProbeResult::success(
                id,
                ProbeKind::TcpReachability,
                Duration::from_millis(20),
                String::new(),
            )
        } else {
            ProbeResult::unreachable(id, ProbeKind::TcpReachability, "refused".into())
        };
        let entry =
            DeviceEntry::from_result("R1", DeviceClass::Lab, result, None, &Thresholds::default());
        FleetSnapshot::from_entries(1, SnapshotSource::Live, vec![entry])
    }

    #[test]
    fn alerts_fail_threshold_and_repeat_and_recovery() {
        let mut tracker = AlertTracker::new(alerts_cfg());
        let down = snapshot_with("core-r1", false);

        for i in 1..=2 {
            let events = tracker.apply(&down, i);
            assert!(events.is_empty(), "unexpected event at fail {}", i);
        }

        let events = tracker.apply(&down, 3);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Down);
        assert_eq!(events[0].device_id, "core-r1");
        assert_eq!(events[0].detail, "refused");

        assert!(tracker.apply(&down, 4).is_empty());

        let events = tracker.apply(&down, 3 + 1800);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Repeat);

        let events = tracker.apply(&snapshot_with("core-r1", true), 20000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Recovered);
        assert!(!tracker.state("core-r1").unwrap().is_down);
    }

    #[test]
    fn recovery_can_be_silenced() {
        let mut tracker = AlertTracker::new(AlertsConfig {
            fail_threshold: 1,
            recovery_notify: false,
            ..alerts_cfg()
        });
        assert_eq!(
            tracker.apply(&snapshot_with("r1", false), 1)[0].kind,
            AlertEventKind::Down
        );
        assert!(tracker.apply(&snapshot_with("r1", true), 2).is_empty());
    }

    #[test]
    fn removed_devices_are_forgotten() {
        let mut tracker = AlertTracker::new(alerts_cfg());
        tracker.apply(&snapshot_with("old", false), 1);
        assert!(tracker.state("old").is_some());

        tracker.apply(&snapshot_with("new", true), 2);
        assert!(tracker.state("old").is_none());
        assert!(tracker.state("new").is_some());
    }
}

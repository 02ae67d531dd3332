use crate::classify::{classify, latency_tier, DeviceStatus, LatencyTier};
use crate::config::Thresholds;
use crate::inventory::DeviceClass;
use crate::probe::{CommandReport, ProbeKind, ProbeOutcome, ProbeResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Latest classified result for one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub hostname: String,
    pub class: DeviceClass,
    pub status: DeviceStatus,
    pub kind: ProbeKind,
    pub outcome: ProbeOutcome,
    pub latency_ms: Option<f64>,
    pub latency_tier: Option<LatencyTier>,
    pub ping_ms: Option<f64>,
    pub detail: String,
    pub command: Option<CommandReport>,
    pub checked_at_unix: i64,
}

impl DeviceEntry {
    pub fn from_result(
        hostname: &str,
        class: DeviceClass,
        result: ProbeResult,
        ping_ms: Option<f64>,
        thresholds: &Thresholds,
    ) -> Self {
        let status = classify(Some(&result), thresholds);
        Self {
            device_id: result.device_id,
            hostname: hostname.to_string(),
            class,
            status,
            kind: result.kind,
            outcome: result.outcome,
            latency_ms: result.latency_ms,
            latency_tier: result.latency_ms.map(|ms| latency_tier(ms, thresholds)),
            ping_ms,
            detail: result.detail,
            command: result.command,
            checked_at_unix: result.timestamp_unix,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetHealth {
    Good,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Placeholder served before the first pass completes.
    None,
    Live,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetAggregate {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub degraded: usize,
    pub unknown: usize,
    pub average_latency_ms: f64,
    pub health_percentage: f64,
    pub health: FleetHealth,
}

impl FleetAggregate {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeviceEntry>) -> Self {
        let mut agg = Self {
            total: 0,
            online: 0,
            offline: 0,
            degraded: 0,
            unknown: 0,
            average_latency_ms: 0.0,
            health_percentage: 0.0,
            health: FleetHealth::Good,
        };
        let mut latency_sum = 0.0_f64;
        let mut latency_count = 0_usize;

        for entry in entries {
            agg.total += 1;
            match entry.status {
                DeviceStatus::Online => agg.online += 1,
                DeviceStatus::Offline => agg.offline += 1,
                DeviceStatus::Degraded => agg.degraded += 1,
                DeviceStatus::Unknown => agg.unknown += 1,
            }
            if let Some(ms) = entry.latency_ms {
                latency_sum += ms;
                latency_count += 1;
            }
        }

        if latency_count > 0 {
            agg.average_latency_ms = round_to(latency_sum / latency_count as f64, 2);
        }
        if agg.total > 0 {
            agg.health_percentage = round_to(agg.online as f64 / agg.total as f64 * 100.0, 1);
        }
        agg.health = if agg.online == agg.total {
            FleetHealth::Good
        } else if agg.online > 0 {
            FleetHealth::Warning
        } else {
            FleetHealth::Critical
        };
        agg
    }
}

/// Immutable result of one collection pass.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    /// Order in which the producing pass started; zero outside the monitor.
    #[serde(skip)]
    pub pass_seq: u64,
    pub generated_at_unix: i64,
    pub generated_at: Option<String>,
    pub source: SnapshotSource,
    pub per_device: BTreeMap<String, DeviceEntry>,
    pub aggregate: FleetAggregate,
}

impl FleetSnapshot {
    pub fn empty() -> Self {
        Self {
            pass_seq: 0,
            generated_at_unix: 0,
            generated_at: None,
            source: SnapshotSource::None,
            per_device: BTreeMap::new(),
            aggregate: FleetAggregate::from_entries(std::iter::empty()),
        }
    }

    /// Builds the snapshot and its aggregate from the same entry set, so
    /// `aggregate.total == per_device.len()` by construction.
    pub fn from_entries(
        generated_at_unix: i64,
        source: SnapshotSource,
        entries: impl IntoIterator<Item = DeviceEntry>,
    ) -> Self {
        let per_device: BTreeMap<String, DeviceEntry> = entries
            .into_iter()
            .map(|e| (e.device_id.clone(), e))
            .collect();
        let aggregate = FleetAggregate::from_entries(per_device.values());
        Self {
            pass_seq: 0,
            generated_at_unix,
            generated_at: format_unix(generated_at_unix),
            source,
            per_device,
            aggregate,
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

fn format_unix(ts: i64) -> Option<String> {
    if ts <= 0 {
        return None;
    }
    let st = UNIX_EPOCH + Duration::from_secs(ts as u64);
    Some(humantime::format_rfc3339_seconds(st).to_string())
}

/// Single-writer publication point. Writers swap the whole `Arc`; readers
/// clone it, so nobody sees a half-written snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    current: Arc<RwLock<Arc<FleetSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(FleetSnapshot::empty()))),
        }
    }

    pub async fn latest(&self) -> Arc<FleetSnapshot> {
        self.current.read().await.clone()
    }

    pub async fn publish(&self, snapshot: FleetSnapshot) -> Arc<FleetSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().await = snapshot.clone();
        snapshot
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

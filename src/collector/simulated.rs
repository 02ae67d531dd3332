use super::{plan_devices, CollectError, FleetCollector};
use crate::config::Thresholds;
use crate::inventory::DeviceRecord;
use crate::probe::{now_unix, ProbeKind, ProbeResult};
use crate::snapshot::{DeviceEntry, FleetSnapshot, SnapshotSource};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Share of devices that report a latency spike on each pass.
const SPIKE_PROBABILITY: f64 = 0.05;

/// Synthesizes plausible probe results without touching the network.
///
/// Every device answers with 10-50 ms latency; a small share spikes past the
/// degraded threshold. Output is tagged `simulated` so it is never mistaken
/// for live data.
pub struct SimulatedCollector {
    rng: Mutex<StdRng>,
    thresholds: Thresholds,
}

impl SimulatedCollector {
    pub fn new(seed: Option<u64>, thresholds: Thresholds) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            thresholds,
        }
    }

    fn sample_latency(&self, rng: &mut StdRng) -> f64 {
        if rng.gen_bool(SPIKE_PROBABILITY) {
            self.thresholds.latency_degraded_ms + rng.gen_range(100.0..300.0)
        } else {
            rng.gen_range(10.0..50.0)
        }
    }
}

#[async_trait]
impl FleetCollector for SimulatedCollector {
    async fn collect(&self, devices: Vec<DeviceRecord>) -> Result<FleetSnapshot, CollectError> {
        let planned = plan_devices(devices, false)?;
        // a panic mid-sample leaves the generator usable
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let entries: Vec<DeviceEntry> = planned
            .into_iter()
            .map(|device| {
                let ms = self.sample_latency(&mut rng);
                let result = ProbeResult::success(
                    &device.record.id,
                    ProbeKind::TcpReachability,
                    Duration::from_secs_f64(ms / 1000.0),
                    format!("simulated reply from {}", device.address),
                );
                DeviceEntry::from_result(
                    &device.record.hostname,
                    device.record.class,
                    result,
                    None,
                    &self.thresholds,
                )
            })
            .collect();
        drop(rng);

        debug!(devices = entries.len(), "simulated collection finished");
        Ok(FleetSnapshot::from_entries(
            now_unix(),
            SnapshotSource::Simulated,
            entries,
        ))
    }
}

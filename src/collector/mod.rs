pub mod simulated;

use crate::config::{Config, ProbesConfig, Thresholds};
use crate::inventory::{DeviceAddress, DeviceClass, DeviceInputError, DeviceRecord, InventoryError};
use crate::probe::reachability::{probe_ping, probe_tcp};
use crate::probe::session::{probe_session, SessionProbe};
use crate::probe::{now_unix, ProbeKind, ProbeOutcome, ProbeResult};
use crate::snapshot::{DeviceEntry, FleetSnapshot, SnapshotSource};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Scheduling headroom added to the collection ceiling.
const CEILING_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("некорректное устройство '{device}': {source}")]
    InvalidDevice {
        device: String,
        source: DeviceInputError,
    },
    #[error("id устройства '{0}' встречается в инвентаре повторно")]
    DuplicateDevice(String),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl CollectError {
    /// Metric label for the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidDevice { .. } | Self::DuplicateDevice(_) => "input",
            Self::Inventory(_) => "inventory",
        }
    }
}

/// Produces one snapshot per call. Implementations never touch shared state.
#[async_trait]
pub trait FleetCollector: Send + Sync {
    async fn collect(&self, devices: Vec<DeviceRecord>) -> Result<FleetSnapshot, CollectError>;
}

#[derive(Debug, Clone)]
pub struct CollectSettings {
    pub max_parallel: usize,
    pub timeout_per_device: Duration,
    pub retries: u32,
    pub probes: ProbesConfig,
    pub thresholds: Thresholds,
}

impl From<&Config> for CollectSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            max_parallel: cfg.max_parallel,
            timeout_per_device: cfg.timeout_per_device(),
            retries: cfg.retries,
            probes: cfg.probes.clone(),
            thresholds: cfg.thresholds,
        }
    }
}

/// A device that passed input validation.
#[derive(Debug, Clone)]
pub(crate) struct PlannedDevice {
    pub record: DeviceRecord,
    pub address: DeviceAddress,
}

/// Validates the whole device list up front; a bad record fails the pass before any probe runs.
pub(crate) fn plan_devices(
    devices: Vec<DeviceRecord>,
    require_credentials: bool,
) -> Result<Vec<PlannedDevice>, CollectError> {
    let mut seen = HashSet::new();
    let mut planned = Vec::with_capacity(devices.len());
    for record in devices {
        if !seen.insert(record.id.clone()) {
            return Err(CollectError::DuplicateDevice(record.id));
        }
        let address = DeviceAddress::parse(&record.address).map_err(|err| {
            CollectError::InvalidDevice {
                device: record.id.clone(),
                source: err.into(),
            }
        })?;
        if require_credentials {
            if let Err(source) = record.require_credentials() {
                return Err(CollectError::InvalidDevice {
                    device: record.id.clone(),
                    source,
                });
            }
        }
        planned.push(PlannedDevice { record, address });
    }
    Ok(planned)
}

/// Probes real devices through a fixed-size pool.
pub struct ProbeCollector {
    settings: CollectSettings,
}

impl ProbeCollector {
    pub fn new(settings: CollectSettings) -> Self {
        Self { settings }
    }

    /// Upper bound on a whole pass: one device budget per pool "wave".
    fn ceiling(&self, devices: usize) -> Duration {
        let parallel = self.settings.max_parallel.max(1);
        let waves = devices.div_ceil(parallel).max(1) as u32;
        self.settings.timeout_per_device * waves + CEILING_SLACK
    }
}

#[async_trait]
impl FleetCollector for ProbeCollector {
    async fn collect(&self, devices: Vec<DeviceRecord>) -> Result<FleetSnapshot, CollectError> {
        let planned = plan_devices(devices, self.settings.probes.session)?;
        let started = Instant::now();
        let deadline = started + self.ceiling(planned.len());

        let pool = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut pending: HashMap<String, (String, DeviceClass)> = HashMap::new();
        let mut tasks = JoinSet::new();

        for device in planned {
            pending.insert(
                device.record.id.clone(),
                (device.record.hostname.clone(), device.record.class),
            );
            let pool = pool.clone();
            let settings = self.settings.clone();
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = pool.acquire_owned().await.ok();
                probe_device(&device, &settings).await
            });
        }

        let entries = gather(tasks, pending, deadline, &self.settings.thresholds).await;

        let snapshot = FleetSnapshot::from_entries(now_unix(), SnapshotSource::Live, entries);
        info!(
            devices = snapshot.aggregate.total,
            online = snapshot.aggregate.online,
            offline = snapshot.aggregate.offline,
            degraded = snapshot.aggregate.degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "сбор по парку завершён"
        );
        Ok(snapshot)
    }
}

/// Collects finished device tasks until `deadline`. Devices still pending then are
/// reported as `timeout` and their tasks detached to run into their own timeouts.
async fn gather(
    mut tasks: JoinSet<DeviceEntry>,
    mut pending: HashMap<String, (String, DeviceClass)>,
    deadline: Instant,
    thresholds: &Thresholds,
) -> Vec<DeviceEntry> {
    let mut entries = Vec::with_capacity(pending.len());
    let mut ceiling_hit = false;
    loop {
        match time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(entry))) => {
                pending.remove(&entry.device_id);
                entries.push(entry);
            }
            Ok(Some(Err(join_err))) => {
                warn!(error = %join_err, "задача проверки устройства завершилась аварийно");
            }
            Ok(None) => break,
            Err(_elapsed) => {
                warn!(
                    pending = pending.len(),
                    "достигнут общий лимит сбора, незавершённые устройства помечены как timeout"
                );
                tasks.detach_all();
                ceiling_hit = true;
                break;
            }
        }
    }

    for (device_id, (hostname, class)) in pending {
        let result = if ceiling_hit {
            ProbeResult::timeout(
                &device_id,
                ProbeKind::TcpReachability,
                "collection ceiling reached before the probe finished".to_string(),
            )
        } else {
            ProbeResult::error(
                &device_id,
                ProbeKind::TcpReachability,
                "probe task panicked".to_string(),
            )
        };
        entries.push(DeviceEntry::from_result(
            &hostname, class, result, None, thresholds,
        ));
    }
    entries
}

/// Runs one device's probe pipeline inside its own budget.
async fn probe_device(device: &PlannedDevice, settings: &CollectSettings) -> DeviceEntry {
    let id = device.record.id.as_str();
    let budget = settings.timeout_per_device;
    let (result, ping_ms) = match time::timeout(budget, run_pipeline(device, settings)).await {
        Ok(done) => done,
        Err(_elapsed) => {
            let kind = if settings.probes.session {
                ProbeKind::CredentialedSession
            } else {
                ProbeKind::TcpReachability
            };
            (
                ProbeResult::timeout(
                    id,
                    kind,
                    format!("device probe exceeded {} ms", budget.as_millis()),
                ),
                None,
            )
        }
    };

    debug!(
        device = %id,
        outcome = result.outcome.as_str(),
        latency_ms = ?result.latency_ms,
        "device probed"
    );
    DeviceEntry::from_result(
        &device.record.hostname,
        device.record.class,
        result,
        ping_ms,
        &settings.thresholds,
    )
}

/// TCP reachability gates the rest; ping is informational; the session result,
/// when one runs, is the one that gets classified.
async fn run_pipeline(
    device: &PlannedDevice,
    settings: &CollectSettings,
) -> (ProbeResult, Option<f64>) {
    let id = device.record.id.as_str();
    let deadline = Instant::now() + settings.timeout_per_device;
    let probes = &settings.probes;
    let mut decisive: Option<ProbeResult> = None;

    if probes.tcp {
        let tcp = probe_tcp_with_retries(device, settings.retries, deadline).await;
        if tcp.outcome != ProbeOutcome::Success {
            return (tcp, None);
        }
        decisive = Some(tcp);
    }

    let mut ping_ms = None;
    if probes.ping {
        let ping = probe_ping(id, &device.address.host, remaining(deadline)).await;
        ping_ms = ping.latency_ms;
        if ping.outcome != ProbeOutcome::Success {
            debug!(device = %id, outcome = ping.outcome.as_str(), detail = %ping.detail, "ping probe did not succeed");
        }
        if decisive.is_none() && !probes.session {
            return (ping, ping_ms);
        }
    }

    if probes.session {
        if let Some(credentials) = device.record.credentials.clone() {
            let session = probe_session(SessionProbe {
                device_id: id.to_string(),
                address: device.address.clone(),
                credentials,
                timeout: remaining(deadline),
                command: probes
                    .command_for(device.record.vendor.as_deref())
                    .map(str::to_string),
                max_output_bytes: probes.max_output_bytes,
            })
            .await;
            return (session, ping_ms);
        }
    }

    let result = decisive.unwrap_or_else(|| {
        ProbeResult::error(
            id,
            ProbeKind::TcpReachability,
            "no probe applicable to this device".to_string(),
        )
    });
    (result, ping_ms)
}

async fn probe_tcp_with_retries(
    device: &PlannedDevice,
    retries: u32,
    deadline: Instant,
) -> ProbeResult {
    let id = device.record.id.as_str();
    let mut attempt = 0;
    loop {
        let result = probe_tcp(id, &device.address, remaining(deadline)).await;
        if result.outcome == ProbeOutcome::Success {
            return result;
        }
        // the prober reports its own timeout as unreachable; running out of the
        // device budget is a timeout at this level
        if remaining(deadline).is_zero() {
            return ProbeResult::timeout(
                id,
                ProbeKind::TcpReachability,
                format!("device budget exhausted: {}", result.detail),
            );
        }
        if attempt >= retries {
            return result;
        }
        attempt += 1;
        debug!(device = %id, attempt, detail = %result.detail, "retrying tcp probe");
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

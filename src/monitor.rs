use crate::alerts::{AlertEventKind, AlertTrackState, AlertTracker};
use crate::collector::{CollectError, FleetCollector};
use crate::config::AlertsConfig;
use crate::inventory::{DeviceRecord, Inventory, InventoryError};
use crate::metrics::Metrics;
use crate::probe::now_unix;
use crate::refresh::{BackgroundRefresh, LoopStatus, RefreshError, RefreshTarget, StopOutcome};
use crate::snapshot::{DeviceEntry, FleetSnapshot, SnapshotStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One collection pass: read the inventory, collect, publish.
struct Pass {
    inventory: Arc<dyn Inventory>,
    collector: Arc<dyn FleetCollector>,
    store: SnapshotStore,
    metrics: Arc<Metrics>,
    alerts: Mutex<AlertTracker>,
    started: AtomicU64,
    /// Sequence of the newest published pass. Held while metrics, alerts and the store change.
    published: tokio::sync::Mutex<u64>,
}

#[async_trait]
impl RefreshTarget for Pass {
    async fn collect(&self) -> Result<FleetSnapshot, CollectError> {
        let seq = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let devices = self.inventory.list_devices().await?;
        let mut snapshot = self.collector.collect(devices).await?;
        snapshot.pass_seq = seq;
        Ok(snapshot)
    }

    async fn publish(&self, snapshot: FleetSnapshot) {
        self.publish_snapshot(snapshot).await;
    }

    fn record_failure(&self, err: &CollectError) {
        self.metrics.inc_refresh_error(err.stage());
    }
}

impl Pass {
    /// Publishes unless a pass that started later got there first; then the newer
    /// snapshot stays and is returned instead.
    async fn publish_snapshot(&self, snapshot: FleetSnapshot) -> Arc<FleetSnapshot> {
        let mut newest = self.published.lock().await;
        if snapshot.pass_seq <= *newest {
            debug!(
                pass = snapshot.pass_seq,
                newest = *newest,
                "pass finished after a newer one, result dropped"
            );
            return self.store.latest().await;
        }
        *newest = snapshot.pass_seq;

        self.metrics.update_from_snapshot(&snapshot);
        self.metrics.inc_refresh();
        self.apply_alerts(&snapshot);
        self.store.publish(snapshot).await
    }

    fn apply_alerts(&self, snapshot: &FleetSnapshot) {
        let events = match self.alerts.lock() {
            Ok(mut tracker) => tracker.apply(snapshot, now_unix()),
            Err(_) => {
                warn!("состояние алертов повреждено, пропускаем");
                return;
            }
        };
        for event in events {
            self.metrics.inc_alert(event.kind.as_str());
            match event.kind {
                AlertEventKind::Down | AlertEventKind::Repeat => warn!(
                    device = %event.device_id,
                    kind = event.kind.as_str(),
                    detail = %event.detail,
                    "устройство недоступно"
                ),
                AlertEventKind::Recovered => info!(
                    device = %event.device_id,
                    "устройство снова доступно"
                ),
            }
        }
    }
}

/// Everything the API layer needs, constructed once and shared by `Arc`.
pub struct FleetMonitor {
    pass: Arc<Pass>,
    refresh: BackgroundRefresh,
}

impl FleetMonitor {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        collector: Arc<dyn FleetCollector>,
        metrics: Arc<Metrics>,
        alerts: AlertsConfig,
        stop_grace: Duration,
    ) -> Self {
        Self {
            pass: Arc::new(Pass {
                inventory,
                collector,
                store: SnapshotStore::new(),
                metrics,
                alerts: Mutex::new(AlertTracker::new(alerts)),
                started: AtomicU64::new(0),
                published: tokio::sync::Mutex::new(0),
            }),
            refresh: BackgroundRefresh::new(stop_grace),
        }
    }

    /// Latest published snapshot, or the empty placeholder before the first pass.
    pub async fn get_snapshot(&self) -> Arc<FleetSnapshot> {
        self.pass.store.latest().await
    }

    /// Collects immediately, outside the loop's timer, and publishes the result.
    /// A pass overtaken by a newer one returns that newer snapshot.
    pub async fn refresh_now(&self) -> Result<Arc<FleetSnapshot>, CollectError> {
        let snapshot = match self.pass.collect().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.pass.record_failure(&err);
                return Err(err);
            }
        };
        Ok(self.pass.publish_snapshot(snapshot).await)
    }

    pub async fn start_background_refresh(&self, interval: Duration) -> Result<(), RefreshError> {
        let target: Arc<dyn RefreshTarget> = self.pass.clone();
        self.refresh.start(interval, target).await
    }

    pub async fn stop_background_refresh(&self) -> Result<StopOutcome, RefreshError> {
        self.refresh.stop().await
    }

    pub async fn background_status(&self) -> LoopStatus {
        self.refresh.status().await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        self.pass.inventory.list_devices().await
    }

    pub async fn get_device(&self, id: &str) -> Result<DeviceRecord, InventoryError> {
        self.pass.inventory.get_device(id).await
    }

    pub async fn latest_entry(&self, id: &str) -> Option<DeviceEntry> {
        self.get_snapshot().await.per_device.get(id).cloned()
    }

    pub fn alert_state(&self, id: &str) -> Option<AlertTrackState> {
        let tracker = self.pass.alerts.lock().ok()?;
        tracker.state(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DeviceStatus;
    use crate::collector::{CollectSettings, ProbeCollector};
    use crate::config::{ProbesConfig, Thresholds};
    use crate::inventory::{DeviceClass, FileInventory, StaticInventory};
    use crate::refresh::LoopState;
    use crate::snapshot::SnapshotSource;
    use std::collections::BTreeSet;
    use tokio::net::TcpListener;

    /// The first call is slow; every call stamps `1001 + call index` as its time.
    #[derive(Default)]
    struct StaggeredCollector {
        calls: AtomicU64,
    }

    #[async_trait]
    impl FleetCollector for StaggeredCollector {
        async fn collect(
            &self,
            _devices: Vec<DeviceRecord>,
        ) -> Result<FleetSnapshot, CollectError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            Ok(FleetSnapshot::from_entries(
                1001 + call as i64,
                SnapshotSource::Live,
                Vec::new(),
            ))
        }
    }

    fn device(id: &str, address: String) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            hostname: id.to_uppercase(),
            address,
            credentials: None,
            tags: BTreeSet::new(),
            class: DeviceClass::Production,
            vendor: Some("cisco".to_string()),
        }
    }

    fn monitor_for(inventory: Arc<dyn Inventory>) -> FleetMonitor {
        let collector = ProbeCollector::new(CollectSettings {
            max_parallel: 5,
            timeout_per_device: Duration::from_secs(2),
            retries: 0,
            probes: ProbesConfig {
                session: false,
                ..ProbesConfig::default()
            },
            thresholds: Thresholds::default(),
        });
        FleetMonitor::new(
            inventory,
            Arc::new(collector),
            Metrics::new().unwrap(),
            AlertsConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn snapshot_is_empty_before_the_first_pass() {
        let monitor = monitor_for(Arc::new(StaticInventory::default()));
        let snap = monitor.get_snapshot().await;
        assert_eq!(snap.source, SnapshotSource::None);
        assert_eq!(snap.aggregate.total, 0);
        assert!(snap.generated_at.is_none());
    }

    #[tokio::test]
    async fn refresh_now_publishes_and_is_stable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let monitor = monitor_for(Arc::new(StaticInventory::new(vec![
            device("core-r1", open),
            device("core-r2", "127.0.0.1:1".to_string()),
        ])));

        let first = monitor.refresh_now().await.unwrap();
        let second = monitor.refresh_now().await.unwrap();

        assert_eq!(first.aggregate.total, 2);
        for (id, entry) in &first.per_device {
            assert_eq!(entry.status, second.per_device[id].status);
        }
        assert_eq!(
            monitor.latest_entry("core-r1").await.unwrap().status,
            DeviceStatus::Online
        );
        assert_eq!(
            monitor.get_snapshot().await.generated_at_unix,
            second.generated_at_unix
        );
    }

    #[tokio::test]
    async fn inventory_failure_keeps_the_last_good_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        std::fs::write(
            &path,
            format!("- id: edge-1\n  hostname: EDGE1\n  address: \"{open}\"\n"),
        )
        .unwrap();

        let monitor = monitor_for(Arc::new(FileInventory::new(&path)));
        let good = monitor.refresh_now().await.unwrap();
        assert_eq!(good.aggregate.online, 1);

        std::fs::remove_file(&path).unwrap();
        let err = monitor.refresh_now().await.unwrap_err();
        assert!(matches!(err, CollectError::Inventory(_)));

        let still = monitor.get_snapshot().await;
        assert_eq!(still.generated_at_unix, good.generated_at_unix);
        assert_eq!(still.aggregate.online, 1);
    }

    #[tokio::test]
    async fn devices_come_from_the_inventory() {
        let monitor = monitor_for(Arc::new(StaticInventory::new(vec![device(
            "core-r1",
            "10.0.0.1:22".to_string(),
        )])));
        assert_eq!(monitor.list_devices().await.unwrap().len(), 1);
        assert_eq!(
            monitor.get_device("core-r1").await.unwrap().hostname,
            "CORE-R1"
        );
        assert!(matches!(
            monitor.get_device("nope").await,
            Err(InventoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn background_refresh_round_trip() {
        let monitor = monitor_for(Arc::new(StaticInventory::default()));
        monitor
            .start_background_refresh(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(monitor.background_status().await.state, LoopState::Running);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(
            monitor.stop_background_refresh().await.unwrap(),
            StopOutcome::Joined
        );

        let status = monitor.background_status().await;
        assert_eq!(status.state, LoopState::Stopped);
        assert_eq!(monitor.get_snapshot().await.source, SnapshotSource::Live);
    }

    #[tokio::test]
    async fn late_older_pass_never_replaces_a_newer_snapshot() {
        let metrics = Metrics::new().unwrap();
        let monitor = Arc::new(FleetMonitor::new(
            Arc::new(StaticInventory::default()),
            Arc::new(StaggeredCollector::default()),
            metrics.clone(),
            AlertsConfig::default(),
            Duration::from_secs(5),
        ));

        let slow = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.refresh_now().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let newer = monitor.refresh_now().await.unwrap();
        assert_eq!(newer.generated_at_unix, 1002);

        let older = slow.await.unwrap().unwrap();
        assert_eq!(older.generated_at_unix, 1002);
        assert_eq!(monitor.get_snapshot().await.generated_at_unix, 1002);
        assert_eq!(metrics.fleet_refresh_total.get(), 1.0);
    }
}

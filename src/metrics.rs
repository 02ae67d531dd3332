use crate::classify::DeviceStatus;
use crate::snapshot::FleetSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fleet_devices_total: Gauge,
    pub fleet_devices_online: Gauge,
    pub fleet_devices_offline: Gauge,
    pub fleet_devices_degraded: Gauge,
    pub fleet_devices_unknown: Gauge,
    pub fleet_health_percent: Gauge,
    pub fleet_average_latency_ms: Gauge,
    pub fleet_last_refresh_timestamp_seconds: Gauge,
    pub fleet_device_up: GaugeVec,
    pub fleet_device_latency_ms: GaugeVec,
    pub fleet_device_status: GaugeVec,
    pub fleet_refresh_total: Counter,
    pub fleet_refresh_errors_total: CounterVec,
    pub fleet_alerts_total: CounterVec,
    pub fleet_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleet_devices_total =
            Gauge::with_opts(opts!("fleet_devices_total", "Devices in the last snapshot"))?;
        let fleet_devices_online =
            Gauge::with_opts(opts!("fleet_devices_online", "Devices classified online"))?;
        let fleet_devices_offline =
            Gauge::with_opts(opts!("fleet_devices_offline", "Devices classified offline"))?;
        let fleet_devices_degraded = Gauge::with_opts(opts!(
            "fleet_devices_degraded",
            "Devices classified degraded"
        ))?;
        let fleet_devices_unknown =
            Gauge::with_opts(opts!("fleet_devices_unknown", "Devices never probed"))?;
        let fleet_health_percent = Gauge::with_opts(opts!(
            "fleet_health_percent",
            "Share of online devices in percent (0..100)"
        ))?;
        let fleet_average_latency_ms = Gauge::with_opts(opts!(
            "fleet_average_latency_ms",
            "Average latency over devices with a measured latency"
        ))?;
        let fleet_last_refresh_timestamp_seconds = Gauge::with_opts(opts!(
            "fleet_last_refresh_timestamp_seconds",
            "Unix timestamp of the last published snapshot"
        ))?;
        let fleet_device_up = GaugeVec::new(
            opts!("fleet_device_up", "1 unless the device is offline"),
            &["device"],
        )?;
        let fleet_device_latency_ms = GaugeVec::new(
            opts!("fleet_device_latency_ms", "Latency of the decisive probe by device"),
            &["device"],
        )?;
        let fleet_device_status = GaugeVec::new(
            opts!(
                "fleet_device_status",
                "1 for the current status of the device, 0 for the others"
            ),
            &["device", "status"],
        )?;
        let fleet_refresh_total = Counter::with_opts(opts!(
            "fleet_refresh_total",
            "Published snapshots since start"
        ))?;
        let fleet_refresh_errors_total = CounterVec::new(
            opts!("fleet_refresh_errors_total", "Failed refresh passes by stage"),
            &["stage"],
        )?;
        let fleet_alerts_total = CounterVec::new(
            opts!("fleet_alerts_total", "Alert transitions by kind"),
            &["kind"],
        )?;
        let fleet_scrape_count_total = Counter::with_opts(opts!(
            "fleet_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &fleet_devices_total)?;
        register(&registry, &fleet_devices_online)?;
        register(&registry, &fleet_devices_offline)?;
        register(&registry, &fleet_devices_degraded)?;
        register(&registry, &fleet_devices_unknown)?;
        register(&registry, &fleet_health_percent)?;
        register(&registry, &fleet_average_latency_ms)?;
        register(&registry, &fleet_last_refresh_timestamp_seconds)?;
        register(&registry, &fleet_device_up)?;
        register(&registry, &fleet_device_latency_ms)?;
        register(&registry, &fleet_device_status)?;
        register(&registry, &fleet_refresh_total)?;
        register(&registry, &fleet_refresh_errors_total)?;
        register(&registry, &fleet_alerts_total)?;
        register(&registry, &fleet_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            fleet_devices_total,
            fleet_devices_online,
            fleet_devices_offline,
            fleet_devices_degraded,
            fleet_devices_unknown,
            fleet_health_percent,
            fleet_average_latency_ms,
            fleet_last_refresh_timestamp_seconds,
            fleet_device_up,
            fleet_device_latency_ms,
            fleet_device_status,
            fleet_refresh_total,
            fleet_refresh_errors_total,
            fleet_alerts_total,
            fleet_scrape_count_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &FleetSnapshot) {
        let agg = &snapshot.aggregate;
        self.fleet_devices_total.set(agg.total as f64);
        self.fleet_devices_online.set(agg.online as f64);
        self.fleet_devices_offline.set(agg.offline as f64);
        self.fleet_devices_degraded.set(agg.degraded as f64);
        self.fleet_devices_unknown.set(agg.unknown as f64);
        self.fleet_health_percent.set(agg.health_percentage);
        self.fleet_average_latency_ms.set(agg.average_latency_ms);
        self.fleet_last_refresh_timestamp_seconds
            .set(snapshot.generated_at_unix as f64);

        // devices removed from the inventory must not linger as stale series
        self.fleet_device_up.reset();
        self.fleet_device_latency_ms.reset();
        self.fleet_device_status.reset();

        for (id, entry) in &snapshot.per_device {
            self.fleet_device_up
                .with_label_values(&[id.as_str()])
                .set(if entry.status == DeviceStatus::Offline {
                    0.0
                } else {
                    1.0
                });
            if let Some(ms) = entry.latency_ms {
                self.fleet_device_latency_ms
                    .with_label_values(&[id.as_str()])
                    .set(ms);
            }
            for status in DeviceStatus::ALL {
                self.fleet_device_status
                    .with_label_values(&[id.as_str(), status.as_str()])
                    .set(if entry.status == status { 1.0 } else { 0.0 });
            }
        }
    }

    pub fn inc_refresh(&self) {
        self.fleet_refresh_total.inc();
    }

    pub fn inc_refresh_error(&self, stage: &str) {
        self.fleet_refresh_errors_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn inc_alert(&self, kind: &str) {
        self.fleet_alerts_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_scrape_count(&self) {
        self.fleet_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

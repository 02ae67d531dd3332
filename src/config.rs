use crate::inventory::{DeviceAddress, DeviceRecord};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub mode: FleetMode,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub collector: CollectorKind,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_timeout_per_device_ms")]
    pub timeout_per_device_ms: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub simulation_seed: Option<u64>,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetMode {
    #[default]
    Lab,
    Production,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    #[default]
    Live,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbesConfig {
    #[serde(default = "default_true")]
    pub tcp: bool,
    #[serde(default)]
    pub ping: bool,
    #[serde(default = "default_true")]
    pub session: bool,
    /// Fallback diagnostic command for vendors without an entry in `vendor_commands`.
    #[serde(default)]
    pub command: Option<String>,
    /// Diagnostic command per vendor, matched as a case-insensitive substring of `vendor`.
    #[serde(default = "default_vendor_commands")]
    pub vendor_commands: BTreeMap<String, String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl ProbesConfig {
    /// Command to run after login on a device of the given vendor.
    pub fn command_for(&self, vendor: Option<&str>) -> Option<&str> {
        let vendor = vendor.map(str::to_ascii_lowercase);
        vendor
            .as_deref()
            .and_then(|vendor| {
                self.vendor_commands
                    .iter()
                    .find(|(key, _)| vendor.contains(key.to_ascii_lowercase().as_str()))
                    .map(|(_, command)| command.as_str())
            })
            .or(self.command.as_deref())
    }
}

/// Latency tiers used by the status classifier, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_latency_degraded_ms")]
    pub latency_degraded_ms: f64,
    #[serde(default = "default_latency_critical_ms")]
    pub latency_critical_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "default_repeat_interval_secs")]
    pub repeat_interval_secs: u64,
    #[serde(default = "default_true")]
    pub recovery_notify: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            ping: false,
            session: true,
            command: None,
            vendor_commands: default_vendor_commands(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            latency_degraded_ms: default_latency_degraded_ms(),
            latency_critical_ms: default_latency_critical_ms(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            fail_threshold: default_fail_threshold(),
            repeat_interval_secs: default_repeat_interval_secs(),
            recovery_notify: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if matches!(self.interval_secs, Some(secs) if secs < 1) {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.max_parallel < 1 {
            return Err(ConfigError::Validation(
                "max_parallel должно быть >= 1".to_string(),
            ));
        }
        if self.timeout_per_device_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_per_device_ms должен быть > 0".to_string(),
            ));
        }

        validate_probes(&self.probes)?;
        validate_thresholds(&self.thresholds)?;
        validate_alerts(&self.alerts)?;
        validate_inventory(&self.inventory, self.probes.session)?;

        Ok(())
    }

    /// Interval between background passes; explicit `interval_secs` wins over the mode default.
    pub fn refresh_interval(&self) -> Duration {
        let secs = self.interval_secs.unwrap_or(match self.mode {
            FleetMode::Lab => 30,
            FleetMode::Production => 60,
        });
        Duration::from_secs(secs)
    }

    pub fn timeout_per_device(&self) -> Duration {
        Duration::from_millis(self.timeout_per_device_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_probes(cfg: &ProbesConfig) -> Result<(), ConfigError> {
    if !cfg.tcp && !cfg.ping && !cfg.session {
        return Err(ConfigError::Validation(
            "probes: должна быть включена хотя бы одна проверка (tcp, ping или session)"
                .to_string(),
        ));
    }
    if cfg.max_output_bytes == 0 {
        return Err(ConfigError::Validation(
            "probes.max_output_bytes должен быть > 0".to_string(),
        ));
    }
    if matches!(&cfg.command, Some(cmd) if cmd.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "probes.command не должен быть пустым".to_string(),
        ));
    }
    for (vendor, command) in &cfg.vendor_commands {
        if vendor.trim().is_empty() || command.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "probes.vendor_commands: пустой вендор или команда ('{vendor}')"
            )));
        }
    }
    Ok(())
}

fn validate_thresholds(cfg: &Thresholds) -> Result<(), ConfigError> {
    if cfg.latency_degraded_ms.is_nan() || cfg.latency_degraded_ms <= 0.0 {
        return Err(ConfigError::Validation(
            "thresholds.latency_degraded_ms должно быть > 0".to_string(),
        ));
    }
    if cfg.latency_critical_ms < cfg.latency_degraded_ms {
        return Err(ConfigError::Validation(
            "thresholds.latency_critical_ms должно быть >= latency_degraded_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    if cfg.fail_threshold < 1 {
        return Err(ConfigError::Validation(
            "alerts.fail_threshold должно быть >= 1".to_string(),
        ));
    }
    if cfg.repeat_interval_secs < 60 {
        return Err(ConfigError::Validation(
            "alerts.repeat_interval_secs должно быть >= 60".to_string(),
        ));
    }
    Ok(())
}

fn validate_inventory(cfg: &InventoryConfig, session_enabled: bool) -> Result<(), ConfigError> {
    if cfg.file.is_some() && !cfg.devices.is_empty() {
        return Err(ConfigError::Validation(
            "inventory: укажите либо devices, либо file, но не оба сразу".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for device in &cfg.devices {
        if device.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "inventory.devices[*].id не должен быть пустым".to_string(),
            ));
        }
        if !ids.insert(device.id.clone()) {
            return Err(ConfigError::Validation(format!(
                "id устройства '{}' должен быть уникальным",
                device.id
            )));
        }
        if let Err(err) = DeviceAddress::parse(&device.address) {
            return Err(ConfigError::Validation(format!(
                "устройство '{}': {err}",
                device.id
            )));
        }
        if session_enabled {
            if let Err(err) = device.require_credentials() {
                return Err(ConfigError::Validation(format!(
                    "устройство '{}': {err}",
                    device.id
                )));
            }
        }
    }
    Ok(())
}

const fn default_true() -> bool {
    true
}

const fn default_max_parallel() -> usize {
    5
}

const fn default_timeout_per_device_ms() -> u64 {
    5000
}

const fn default_stop_grace_secs() -> u64 {
    5
}

fn default_vendor_commands() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("arista".to_string(), "show version".to_string()),
        ("cisco".to_string(), "show version".to_string()),
        ("juniper".to_string(), "show system uptime".to_string()),
    ])
}

const fn default_max_output_bytes() -> usize {
    64 * 1024
}

const fn default_latency_degraded_ms() -> f64 {
    500.0
}

const fn default_latency_critical_ms() -> f64 {
    2000.0
}

const fn default_fail_threshold() -> u32 {
    3
}

const fn default_repeat_interval_secs() -> u64 {
    1800
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        serde_yaml::from_str(
            r#"
listen: "127.0.0.1:9110"
probes:
  session: false
inventory:
  devices:
    - id: r1
      hostname: core-router
      address: "10.0.0.1"
"#,
        )
        .expect("валидный YAML")
    }

    #[test]
    fn defaults_follow_mode_and_pool_size() {
        let mut cfg = valid_config();
        cfg.validate().expect("конфигурация валидна");
        assert_eq!(cfg.max_parallel, 5);
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(30));
        assert_eq!(cfg.thresholds.latency_degraded_ms, 500.0);
        assert_eq!(cfg.thresholds.latency_critical_ms, 2000.0);

        cfg.mode = FleetMode::Production;
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(60));
        cfg.interval_secs = Some(7);
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(7));
    }

    #[test]
    fn rejects_malformed_device_address() {
        let mut cfg = valid_config();
        cfg.inventory.devices[0].address = "10.0.0.1:0".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn session_probes_require_credentials() {
        let mut cfg = valid_config();
        cfg.probes.session = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut cfg = valid_config();
        cfg.thresholds.latency_critical_ms = 100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let mut cfg = valid_config();
        let dup = cfg.inventory.devices[0].clone();
        cfg.inventory.devices.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn vendor_picks_its_diagnostic_command() {
        let mut probes = ProbesConfig::default();
        assert_eq!(probes.command_for(Some("Cisco IOS-XE")), Some("show version"));
        assert_eq!(probes.command_for(Some("juniper")), Some("show system uptime"));
        assert_eq!(probes.command_for(Some("mikrotik")), None);
        assert_eq!(probes.command_for(None), None);

        probes.command = Some("uptime".to_string());
        assert_eq!(probes.command_for(Some("mikrotik")), Some("uptime"));
        assert_eq!(probes.command_for(Some("arista")), Some("show version"));
    }

    #[test]
    fn rejects_empty_vendor_command() {
        let mut cfg = valid_config();
        cfg.probes
            .vendor_commands
            .insert("cisco".to_string(), "  ".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn example_config_parses() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример разбирается");
        cfg.validate().expect("пример валиден");
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a device is treated operationally. Replaces guessing "lab" from tags or port numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Lab,
    Production,
    #[default]
    Unclassified,
}

#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// A device as supplied by the inventory store. Read-only from the monitor's side.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub class: DeviceClass,
    #[serde(default)]
    pub vendor: Option<String>,
}

impl DeviceRecord {
    pub fn require_credentials(&self) -> Result<&Credentials, DeviceInputError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(DeviceInputError::MissingCredentials)?;
        if creds.username.trim().is_empty() {
            return Err(DeviceInputError::MissingUsername);
        }
        if creds.password.is_none() && creds.key_path.is_none() {
            return Err(DeviceInputError::MissingSecret);
        }
        Ok(creds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceInputError {
    #[error("{0}")]
    Address(#[from] AddressError),
    #[error("не заданы учётные данные")]
    MissingCredentials,
    #[error("в учётных данных не задано имя пользователя")]
    MissingUsername,
    #[error("в учётных данных нет ни пароля, ни ключа")]
    MissingSecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("адрес устройства пуст")]
    Empty,
    #[error("некорректный хост в адресе '{0}'")]
    InvalidHost(String),
    #[error("некорректный порт в адресе '{0}': ожидается 1..65535")]
    InvalidPort(String),
}

/// Parsed `host[:port]`; the port defaults to 22.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
}

impl DeviceAddress {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::InvalidHost(raw.to_string()))?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(AddressError::InvalidHost(raw.to_string()));
            }
            let port = match tail {
                "" => DEFAULT_SSH_PORT,
                _ => match tail.strip_prefix(':') {
                    Some(p) => parse_port(p, raw)?,
                    None => return Err(AddressError::InvalidHost(raw.to_string())),
                },
            };
            (host.to_string(), port)
        } else if raw.parse::<Ipv6Addr>().is_ok() {
            (raw.to_string(), DEFAULT_SSH_PORT)
        } else {
            match raw.split_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(port, raw)?),
                None => (raw.to_string(), DEFAULT_SSH_PORT),
            }
        };

        if !is_valid_host(&host) {
            return Err(AddressError::InvalidHost(raw.to_string()));
        }

        Ok(Self { host, port })
    }

    /// `host:port` suitable for `TcpStream::connect`, bracketing IPv6 literals.
    pub fn socket_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_target())
    }
}

fn parse_port(text: &str, raw: &str) -> Result<u16, AddressError> {
    match text.parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(AddressError::InvalidPort(raw.to_string())),
    }
}

fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            })
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("хранилище инвентаря недоступно ({path}): {source}")]
    Unavailable {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать инвентарь {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("устройство '{0}' не найдено")]
    NotFound(String),
}

/// Read-only view of the device inventory owned by an external store.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError>;

    async fn get_device(&self, id: &str) -> Result<DeviceRecord, InventoryError> {
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))
    }
}

/// Devices listed inline in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: Vec<DeviceRecord>,
}

impl StaticInventory {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        Ok(self.devices.clone())
    }
}

/// YAML device list re-read on every call, so edits are picked up without a restart.
#[derive(Debug, Clone)]
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Inventory for FileInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        let path = self.path.display().to_string();
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| InventoryError::Unavailable {
                path: path.clone(),
                source,
            })?;
        serde_yaml::from_str(&text).map_err(|source| InventoryError::Parse { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn address_defaults_to_ssh_port() {
        let addr = DeviceAddress::parse("10.0.0.1").unwrap();
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 22);

        let addr = DeviceAddress::parse("localhost:2222").unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 2222);
        assert_eq!(addr.socket_target(), "localhost:2222");
    }

    #[test]
    fn address_accepts_ipv6_forms() {
        let bare = DeviceAddress::parse("fe80::1").unwrap();
        assert_eq!(bare.port, 22);
        assert_eq!(bare.socket_target(), "[fe80::1]:22");

        let bracketed = DeviceAddress::parse("[::1]:830").unwrap();
        assert_eq!(bracketed.host, "::1");
        assert_eq!(bracketed.port, 830);
    }

    #[test]
    fn address_rejects_bad_input() {
        assert_eq!(DeviceAddress::parse("  "), Err(AddressError::Empty));
        assert!(matches!(
            DeviceAddress::parse("host:0"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            DeviceAddress::parse("host:70000"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            DeviceAddress::parse("bad host:22"),
            Err(AddressError::InvalidHost(_))
        ));
        assert!(matches!(
            DeviceAddress::parse("[::1"),
            Err(AddressError::InvalidHost(_))
        ));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: Some("hunter2".to_string()),
            key_path: None,
            key_passphrase: None,
        };
        let text = format!("{creds:?}");
        assert!(!text.contains("hunter2"));
        assert!(text.contains("admin"));
    }

    #[tokio::test]
    async fn file_inventory_reads_and_reports_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- id: sw1\n  hostname: SW-1\n  address: \"192.0.2.10\"\n  class: production\n  tags: [core]"
        )
        .unwrap();

        let inventory = FileInventory::new(file.path());
        let devices = inventory.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].class, DeviceClass::Production);
        assert!(devices[0].tags.contains("core"));
        assert_eq!(inventory.get_device("sw1").await.unwrap().hostname, "SW-1");
        assert!(matches!(
            inventory.get_device("nope").await,
            Err(InventoryError::NotFound(_))
        ));

        let missing = FileInventory::new(file.path().with_extension("missing"));
        assert!(matches!(
            missing.list_devices().await,
            Err(InventoryError::Unavailable { .. })
        ));
    }
}

//! Persisted device configuration
//!
//! Owns the single live [`Configuration`] record and its JSON file. All
//! mutation goes through the `apply_*` merge functions; persistence is a whole
//! file rewrite, so an interrupted save never damages the previous version.

use crate::platform::Addressing;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use serde_valid::Validate;
use std::{
    fs,
    io::{ErrorKind, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

/// Sanity limit for the configuration file and uploaded configuration payloads
pub const CONFIG_MAX_SIZE: usize = 4096;

pub const DEFAULT_STA_TIMEOUT: u32 = 15;
pub const DEFAULT_AP_TIMEOUT: u32 = 60;
pub const MIN_STA_TIMEOUT: u32 = 5;
pub const MIN_AP_TIMEOUT: u32 = 15;

const NO_CONFIG_ID: &str = "No Config Found";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Configuration {
    /* device */
    pub id: String,

    /* network */
    pub ssid: String,
    pub passphrase: String,
    pub hostname: String,
    pub ip: [u8; 4],
    pub netmask: [u8; 4],
    pub gateway: [u8; 4],
    pub dhcp: bool,
    /// Host an access point when the startup join fails
    pub ap_fallback: bool,
    /// Seconds to wait for the station join
    pub sta_timeout: u32,
    /// Seconds to wait in access point mode
    pub ap_timeout: u32,
}

impl Configuration {
    /// Built-in configuration used when nothing has been persisted yet
    pub fn defaults(chip_id: u32) -> Self {
        Self {
            id: NO_CONFIG_ID.to_string(),
            hostname: default_hostname(chip_id),
            dhcp: true,
            ap_fallback: true,
            ..Self::with_default_timeouts()
        }
    }

    fn with_default_timeouts() -> Self {
        Self {
            sta_timeout: DEFAULT_STA_TIMEOUT,
            ap_timeout: DEFAULT_AP_TIMEOUT,
            ..Default::default()
        }
    }

    /// Station addressing; the gateway doubles as DNS server for static setups
    pub fn addressing(&self) -> Addressing {
        if self.dhcp {
            Addressing::Dhcp
        } else {
            Addressing::Static {
                ip: Ipv4Addr::from(self.ip),
                gateway: Ipv4Addr::from(self.gateway),
                netmask: Ipv4Addr::from(self.netmask),
                dns: Ipv4Addr::from(self.gateway),
            }
        }
    }

    fn clamp_timeouts(&mut self) {
        self.sta_timeout = self.sta_timeout.max(MIN_STA_TIMEOUT);
        self.ap_timeout = self.ap_timeout.max(MIN_AP_TIMEOUT);
    }
}

pub fn default_hostname(chip_id: u32) -> String {
    format!("esps-{chip_id:x}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Persisted file parsed and applied
    Loaded,
    /// No file found, defaults created and persisted
    CreatedDefaults,
    /// File unusable, record left zeroed
    Rejected,
}

#[derive(Serialize, Validate)]
struct ConfigDocument {
    #[validate]
    device: DeviceSection,
    #[validate]
    network: NetworkSection,
}

#[derive(Serialize, Validate)]
struct DeviceSection {
    id: String,
}

#[derive(Serialize, Validate)]
struct NetworkSection {
    ssid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    passphrase: Option<String>,
    #[validate(min_length = 1)]
    hostname: String,
    ip: [u8; 4],
    netmask: [u8; 4],
    gateway: [u8; 4],
    dhcp: bool,
    #[validate(minimum = 5)]
    sta_timeout: u32,
    ap_fallback: bool,
    #[validate(minimum = 15)]
    ap_timeout: u32,
}

impl ConfigDocument {
    fn new(config: &Configuration, include_credentials: bool) -> Self {
        Self {
            device: DeviceSection {
                id: config.id.clone(),
            },
            network: NetworkSection {
                ssid: config.ssid.clone(),
                passphrase: include_credentials.then(|| config.passphrase.clone()),
                hostname: config.hostname.clone(),
                ip: config.ip,
                netmask: config.netmask,
                gateway: config.gateway,
                dhcp: config.dhcp,
                sta_timeout: config.sta_timeout,
                ap_fallback: config.ap_fallback,
                ap_timeout: config.ap_timeout,
            },
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
    chip_id: u32,
    config: Configuration,
}

impl ConfigStore {
    /// Create a store for `path`; the record stays zeroed until [`Self::load`]
    pub fn new(path: impl Into<PathBuf>, chip_id: u32) -> Self {
        Self {
            path: path.into(),
            chip_id,
            config: Configuration::default(),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted configuration
    ///
    /// A missing file is replaced by the built-in defaults, which are written
    /// back immediately. An oversized or unparsable file aborts the load and
    /// leaves the record zeroed.
    pub fn load(&mut self) -> LoadOutcome {
        self.config = Configuration::default();

        match self.read_document() {
            Ok(Some(document)) => {
                self.config = Configuration::with_default_timeouts();
                self.apply_network_fields(&document);
                self.apply_device_fields(&document);
                info!("configuration loaded from {:?}", self.path);
                LoadOutcome::Loaded
            }
            Ok(None) => {
                info!("no configuration file found, creating defaults");
                self.config = Configuration::defaults(self.chip_id);
                self.save_or_log();
                LoadOutcome::CreatedDefaults
            }
            Err(e) => {
                error!("configuration not loaded: {e:#}");
                LoadOutcome::Rejected
            }
        }
    }

    fn read_document(&self) -> Result<Option<Value>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(format!("failed to stat config file: {:?}", self.path));
            }
        };

        anyhow::ensure!(
            metadata.len() <= CONFIG_MAX_SIZE as u64,
            "configuration file too large: {} bytes",
            metadata.len()
        );

        let content = fs::read(&self.path)
            .context(format!("failed to read config file: {:?}", self.path))?;
        let document = serde_json::from_slice::<Value>(&content)
            .context("configuration file format error")?;

        anyhow::ensure!(
            document.is_object(),
            "configuration file format error: not an object"
        );

        Ok(Some(document))
    }

    /// Validate, serialize with credentials and replace the persisted file
    pub fn save(&self) -> Result<()> {
        if let Err(e) = self.validate() {
            warn!("saving configuration with invalid fields: {e:#}");
        }

        let document = ConfigDocument::new(&self.config, true);
        let json =
            serde_json::to_string_pretty(&document).context("failed to serialize configuration")?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .context(format!("failed to create configuration file: {temp_path:?}"))?;

        writeln!(file, "{json}").context("failed to write configuration file")?;
        file.sync_all()
            .context("failed to sync configuration file")?;

        fs::rename(&temp_path, &self.path)
            .context(format!("failed to replace configuration file: {:?}", self.path))?;

        debug!("configuration saved to {:?}", self.path);
        Ok(())
    }

    /// Save, logging errors instead of propagating them
    ///
    /// The in-memory record stays authoritative until the next successful save.
    pub fn save_or_log(&self) {
        if let Err(e) = self.save() {
            error!("failed to save configuration: {e:#}");
        }
    }

    pub fn validate(&self) -> Result<()> {
        ConfigDocument::new(&self.config, false)
            .validate()
            .context("configuration validation failed")
    }

    /// Structured representation of the record
    ///
    /// The passphrase is only part of the document if `include_credentials`.
    pub fn serialize(&self, include_credentials: bool) -> Value {
        serde_json::to_value(ConfigDocument::new(&self.config, include_credentials))
            .unwrap_or_else(|e| {
                error!("failed to serialize configuration: {e:#}");
                Value::Null
            })
    }

    pub fn serialize_pretty(&self, include_credentials: bool) -> Result<String> {
        serde_json::to_string_pretty(&ConfigDocument::new(&self.config, include_credentials))
            .context("failed to serialize configuration")
    }

    /// Merge the `network` object of `payload` into the record
    ///
    /// Missing fields keep their value. Address fields only change when given
    /// as a 4-element array of octets.
    pub fn apply_network_fields(&mut self, payload: &Value) {
        match payload.get("network").and_then(Value::as_object) {
            Some(network) => {
                let config = &mut self.config;

                if let Some(ssid) = network.get("ssid").and_then(Value::as_str) {
                    config.ssid = ssid.to_string();
                }
                if let Some(passphrase) = network.get("passphrase").and_then(Value::as_str) {
                    config.passphrase = passphrase.to_string();
                }
                if let Some(hostname) = network.get("hostname").and_then(Value::as_str) {
                    config.hostname = hostname.to_string();
                }

                for (key, field) in [
                    ("ip", &mut config.ip),
                    ("netmask", &mut config.netmask),
                    ("gateway", &mut config.gateway),
                ] {
                    apply_octets(network, key, field);
                }

                if let Some(dhcp) = network.get("dhcp").and_then(Value::as_bool) {
                    config.dhcp = dhcp;
                }
                if let Some(ap_fallback) = network.get("ap_fallback").and_then(Value::as_bool) {
                    config.ap_fallback = ap_fallback;
                }
                if let Some(timeout) = network.get("sta_timeout").and_then(as_seconds) {
                    config.sta_timeout = timeout;
                }
                if let Some(timeout) = network.get("ap_timeout").and_then(as_seconds) {
                    config.ap_timeout = timeout;
                }

                config.clamp_timeouts();
            }
            None => info!("no network settings found"),
        }

        if self.config.hostname.is_empty() {
            self.config.hostname = default_hostname(self.chip_id);
        }
    }

    /// Merge the `device` object of `payload` into the record
    pub fn apply_device_fields(&mut self, payload: &Value) {
        match payload.get("device").and_then(Value::as_object) {
            Some(device) => {
                if let Some(id) = device.get("id").and_then(Value::as_str) {
                    self.config.id = id.to_string();
                }
            }
            None => info!("no device settings found"),
        }
    }
}

fn apply_octets(network: &Map<String, Value>, key: &str, field: &mut [u8; 4]) {
    let Some(value) = network.get(key) else {
        return;
    };

    match parse_octets(value) {
        Some(octets) => *field = octets,
        None => warn!("ignoring malformed {key}: {value}"),
    }
}

fn parse_octets(value: &Value) -> Option<[u8; 4]> {
    let array = value.as_array()?;

    if array.len() != 4 {
        return None;
    }

    let mut octets = [0u8; 4];
    for (octet, value) in octets.iter_mut().zip(array) {
        *octet = u8::try_from(value.as_u64()?).ok()?;
    }

    Some(octets)
}

fn as_seconds(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .map(|seconds| u32::try_from(seconds).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const CHIP_ID: u32 = 0xabc123;

    fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("config.json"), CHIP_ID)
    }

    fn configured_store(dir: &TempDir) -> ConfigStore {
        let mut store = store_in(dir);
        store.load();
        store.apply_network_fields(&json!({
            "network": {
                "ssid": "Lab",
                "passphrase": "secret",
                "hostname": "pixels",
                "ip": [192, 168, 1, 50],
                "netmask": [255, 255, 255, 0],
                "gateway": [192, 168, 1, 1],
                "dhcp": false,
                "sta_timeout": 20,
                "ap_fallback": false,
                "ap_timeout": 90
            }
        }));
        store.apply_device_fields(&json!({"device": {"id": "Porch"}}));
        store
    }

    #[test]
    fn test_load_without_file_creates_defaults() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = store_in(&dir);

        assert_eq!(store.load(), LoadOutcome::CreatedDefaults);

        let config = store.config();
        assert!(config.ssid.is_empty());
        assert!(config.passphrase.is_empty());
        assert!(config.ap_fallback);
        assert_eq!(config.hostname, "esps-abc123");
        assert_eq!(config.id, "No Config Found");
        assert!(store.path().exists());

        // defaults survive a reload
        let mut reloaded = store_in(&dir);
        assert_eq!(reloaded.load(), LoadOutcome::Loaded);
        assert_eq!(reloaded.config(), store.config());
    }

    #[test]
    fn test_load_clamps_timeouts() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"network":{"ssid":"Lab","hostname":"h","sta_timeout":1,"ap_timeout":3}}"#,
        )
        .expect("should write config");

        assert_eq!(store.load(), LoadOutcome::Loaded);
        assert_eq!(store.config().sta_timeout, MIN_STA_TIMEOUT);
        assert_eq!(store.config().ap_timeout, MIN_AP_TIMEOUT);
    }

    #[test]
    fn test_load_missing_timeouts_uses_defaults() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = store_in(&dir);
        fs::write(store.path(), r#"{"network":{"ssid":"Lab"}}"#).expect("should write config");

        assert_eq!(store.load(), LoadOutcome::Loaded);
        assert_eq!(store.config().sta_timeout, DEFAULT_STA_TIMEOUT);
        assert_eq!(store.config().ap_timeout, DEFAULT_AP_TIMEOUT);
        assert_eq!(store.config().hostname, "esps-abc123");
    }

    #[test]
    fn test_load_rejects_oversized_file() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = store_in(&dir);
        let padding = " ".repeat(CONFIG_MAX_SIZE);
        let content = format!(r#"{{"device":{{"id":"big"}}}}{padding}"#);
        fs::write(store.path(), &content).expect("should write config");

        assert_eq!(store.load(), LoadOutcome::Rejected);
        assert_eq!(store.config(), &Configuration::default());
        // the file is left alone
        assert_eq!(
            fs::read_to_string(store.path()).expect("should read config"),
            content
        );
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = store_in(&dir);
        fs::write(store.path(), "{\"network\": ").expect("should write config");

        assert_eq!(store.load(), LoadOutcome::Rejected);
        assert_eq!(store.config(), &Configuration::default());
    }

    #[test]
    fn test_load_rejects_non_object_document() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = store_in(&dir);
        fs::write(store.path(), "[]").expect("should write config");

        assert_eq!(store.load(), LoadOutcome::Rejected);
        assert_eq!(store.config(), &Configuration::default());
        assert_eq!(fs::read_to_string(store.path()).expect("should read config"), "[]");
    }

    #[test]
    fn test_round_trip_without_credentials_drops_passphrase() {
        let dir = TempDir::new().expect("should create temp dir");
        let store = configured_store(&dir);

        let document = store.serialize(false);
        assert!(document["network"].get("passphrase").is_none());

        let other = TempDir::new().expect("should create temp dir");
        let mut reloaded = store_in(&other);
        fs::write(reloaded.path(), document.to_string()).expect("should write config");
        assert_eq!(reloaded.load(), LoadOutcome::Loaded);

        let expected = Configuration {
            passphrase: String::new(),
            ..store.config().clone()
        };
        assert_eq!(reloaded.config(), &expected);
    }

    #[test]
    fn test_round_trip_with_credentials_keeps_passphrase() {
        let dir = TempDir::new().expect("should create temp dir");
        let store = configured_store(&dir);
        store.save().expect("should save");

        let mut reloaded = store_in(&dir);
        assert_eq!(reloaded.load(), LoadOutcome::Loaded);
        assert_eq!(reloaded.config(), store.config());
        assert_eq!(reloaded.config().passphrase, "secret");
    }

    #[test]
    fn test_malformed_address_leaves_field_unchanged() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = configured_store(&dir);

        store.apply_network_fields(&json!({
            "network": {
                "ip": [10, 0, 0],
                "netmask": "255.255.0.0",
                "gateway": [10, 0, 0, 300],
                "ssid": "Workshop"
            }
        }));

        let config = store.config();
        assert_eq!(config.ip, [192, 168, 1, 50]);
        assert_eq!(config.netmask, [255, 255, 255, 0]);
        assert_eq!(config.gateway, [192, 168, 1, 1]);
        assert_eq!(config.ssid, "Workshop");
    }

    #[test]
    fn test_partial_payload_keeps_other_fields() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = configured_store(&dir);
        let before = store.config().clone();

        store.apply_network_fields(&json!({"network": {"dhcp": true}}));
        store.apply_device_fields(&json!({"network": {}}));

        assert_eq!(
            store.config(),
            &Configuration {
                dhcp: true,
                ..before
            }
        );
    }

    #[test]
    fn test_empty_hostname_is_regenerated() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = configured_store(&dir);

        store.apply_network_fields(&json!({"network": {"hostname": ""}}));

        assert_eq!(store.config().hostname, "esps-abc123");
    }

    #[test]
    fn test_save_failure_keeps_record() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut store = ConfigStore::new(dir.path().join("missing/config.json"), CHIP_ID);
        store.apply_device_fields(&json!({"device": {"id": "kept"}}));

        assert!(store.save().is_err());
        assert_eq!(store.config().id, "kept");
    }

    #[test]
    fn test_validate_flags_short_timeouts() {
        let dir = TempDir::new().expect("should create temp dir");
        let store = store_in(&dir);

        // zeroed record: empty hostname and zero timeouts
        assert!(store.validate().is_err());

        let configured = configured_store(&dir);
        assert!(configured.validate().is_ok());
    }

    #[test]
    fn test_static_addressing_uses_gateway_as_dns() {
        let dir = TempDir::new().expect("should create temp dir");
        let store = configured_store(&dir);

        assert_eq!(
            store.config().addressing(),
            Addressing::Static {
                ip: Ipv4Addr::new(192, 168, 1, 50),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                dns: Ipv4Addr::new(192, 168, 1, 1),
            }
        );
    }
}

//! Hub configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/hub.toml` (or an explicit path)
//! 2. Environment variables prefixed with `ROV_HUB_`, with `__` separating
//!    nested keys (e.g. `ROV_HUB_SURFACE__BIND=127.0.0.1:6000`)
//!
//! The `[defaults]` table is file-only. Environment keys are case-folded, so
//! they cannot name case-sensitive store keys such as `Thr_FP`; variables
//! under `ROV_HUB_DEFAULTS` are ignored.
//!
//! Every field has a default matching the vehicle's stock wiring, so an empty
//! file yields a working hub.
//!
//! # Example
//! ```no_run
//! use rov_hub::config::HubConfig;
//!
//! let config = HubConfig::load_from("config/hub.toml")?;
//! config.validate()?;
//! println!("Surface listener: {}", config.surface.bind);
//! # Ok::<(), rov_hub::error::HubError>(())
//! ```

use crate::error::{HubError, HubResult};
use crate::logging::{parse_log_level, LogFormat};
use crate::store::{DeviceId, Frame, Store};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Section that the environment provider never touches.
const FILE_ONLY_SECTION: &str = "defaults";

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/hub.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ROV_HUB_";

/// PWM value that holds a thruster or motor still.
pub const THRUSTER_IDLE: u16 = 1500;

/// PWM value that switches a light off.
pub const LIGHT_OFF: u16 = 1100;

/// Top-level hub configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Logging settings.
    pub logging: LoggingSettings,
    /// Surface (TCP) channel settings.
    pub surface: SurfaceConfig,
    /// Settings shared by every serial device channel.
    pub serial: SerialConfig,
    /// Device boards, in port order.
    pub devices: Vec<DeviceConfig>,
    /// Default snapshot forced onto the surface partition when a session ends.
    pub defaults: Frame,
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// ANSI colors on the pretty and compact formats.
    pub ansi: bool,
    /// Source file and line on every event.
    pub file_and_line: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            ansi: true,
            file_and_line: false,
        }
    }
}

/// Surface channel section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Identity of the surface partition.
    pub identity: DeviceId,
    /// Listen address.
    pub bind: SocketAddr,
    /// Read/write inactivity timeout for a session.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Receive buffer size for one frame.
    pub buffer_size: usize,
    /// Keys sent back to the operator station.
    pub transmit: Vec<String>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            identity: DeviceId::from("surface"),
            bind: SocketAddr::from(([0, 0, 0, 0], 50000)),
            session_timeout: Duration::from_secs(3),
            buffer_size: 4096,
            transmit: strings(&[
                "status_T",
                "status_A",
                "status_M",
                "status_I",
                "error_T",
                "error_A",
                "error_M",
                "error_I",
                "Sen_IMU_X",
                "Sen_IMU_Y",
                "Sen_IMU_Z",
                "Sen_IMU_Temp",
            ]),
        }
    }
}

/// Serial section, shared by all device channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line speed.
    pub baud_rate: u32,
    /// How long to wait for a reply line.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// How long a write may take before the line is considered lost.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Pause between failed open attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Pause after every exchange round.
    #[serde(with = "humantime_serde")]
    pub exchange_delay: Duration,
    /// Reply field carrying the board's identity.
    pub identity_field: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 230_400,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            exchange_delay: Duration::from_millis(20),
            identity_field: "deviceID".to_string(),
        }
    }
}

/// One device board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Identity the channel starts with.
    pub id: DeviceId,
    /// Serial path.
    pub port: String,
    /// Keys sent down to the board.
    #[serde(default)]
    pub transmit: Vec<String>,
}

fn strings(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| (*k).to_string()).collect()
}

fn stock_devices() -> Vec<DeviceConfig> {
    let layout: [(&str, &str, &[&str]); 4] = [
        (
            "Ard_T",
            "/dev/ttyACM0",
            &[
                "Thr_FP", "Thr_FS", "Thr_AP", "Thr_AS", "Thr_TFP", "Thr_TFS", "Thr_TAP", "Thr_TAS",
            ],
        ),
        ("Ard_A", "/dev/ttyACM1", &["Mot_R", "Mot_G", "Mot_F"]),
        ("Ard_M", "/dev/ttyACM2", &["Thr_M", "LED_M"]),
        ("Ard_I", "/dev/ttyACM3", &[]),
    ];
    layout
        .into_iter()
        .map(|(id, port, transmit)| DeviceConfig {
            id: DeviceId::from(id),
            port: port.to_string(),
            transmit: strings(transmit),
        })
        .collect()
}

fn stock_defaults() -> Frame {
    let mut defaults = Frame::new();
    for key in [
        "Thr_FP", "Thr_FS", "Thr_AP", "Thr_AS", "Thr_TFP", "Thr_TFS", "Thr_TAP", "Thr_TAS",
        "Mot_R", "Mot_G", "Mot_F",
    ] {
        defaults.insert(key.to_string(), json!(THRUSTER_IDLE));
    }
    defaults.insert("LED_M".to_string(), json!(LIGHT_OFF));
    defaults
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            surface: SurfaceConfig::default(),
            serial: SerialConfig::default(),
            devices: stock_devices(),
            defaults: stock_defaults(),
        }
    }
}

fn has_null(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.iter().any(has_null),
        serde_json::Value::Object(map) => map.values().any(has_null),
        _ => false,
    }
}

fn is_file_only(key: &str) -> bool {
    key.split('.')
        .next()
        .is_some_and(|section| section.eq_ignore_ascii_case(FILE_ONLY_SECTION))
}

impl HubConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> HubResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment.
    ///
    /// A missing file is not an error; the stock defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HubResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(HubError::from)
    }

    /// The provider chain used by [`HubConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .split("__")
                    .filter(|key| !is_file_only(key.as_str())),
            )
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> HubResult<()> {
        parse_log_level(&self.logging.level)?;

        if self.surface.buffer_size == 0 {
            return Err(HubError::Configuration(
                "surface.buffer_size must be greater than zero".into(),
            ));
        }
        if self.serial.identity_field.trim().is_empty() {
            return Err(HubError::Configuration(
                "serial.identity_field must not be empty".into(),
            ));
        }

        if let Some(key) = self.defaults.iter().find_map(|(k, v)| has_null(v).then_some(k)) {
            return Err(HubError::Configuration(format!(
                "defaults.{key} holds a null, which is not a safe state"
            )));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id == self.surface.identity {
                return Err(HubError::Configuration(format!(
                    "Device identity '{}' collides with the surface identity",
                    device.id
                )));
            }
            if !ids.insert(&device.id) {
                return Err(HubError::Configuration(format!(
                    "Duplicate device identity: {}",
                    device.id
                )));
            }
        }

        let store = self.build_store()?;
        if !store.conflicts().is_empty() {
            let listed = store
                .conflicts()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HubError::Configuration(format!(
                "Transmission whitelists overlap: {listed}"
            )));
        }

        Ok(())
    }

    /// Render the configuration as a TOML document that loads back unchanged.
    pub fn to_toml(&self) -> HubResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HubError::Configuration(format!("Cannot render configuration: {e}")))
    }

    /// Build a fresh store with one partition per configured identity.
    pub fn build_store(&self) -> HubResult<Store> {
        self.devices
            .iter()
            .fold(
                Store::builder(self.surface.identity.clone(), self.surface.transmit.clone()),
                |builder, device| builder.device(device.id.clone(), device.transmit.clone()),
            )
            .defaults(self.defaults.clone())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_config_is_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices.len(), 4);
        assert_eq!(config.surface.bind.port(), 50000);
        assert_eq!(config.defaults["LED_M"], 1100);
        assert_eq!(config.defaults["Mot_F"], 1500);
    }

    #[test]
    fn stock_store_routes_thruster_keys() {
        let store = HubConfig::default().build_store().unwrap();
        assert_eq!(store.owner_of("Thr_TAS"), Some(&DeviceId::from("Ard_T")));
        assert_eq!(store.owner_of("LED_M"), Some(&DeviceId::from("Ard_M")));
        assert_eq!(store.owner_of("status_T"), None);
        assert_eq!(store.identities().len(), 5);
    }

    #[test]
    fn rejects_overlapping_whitelists() {
        let mut config = HubConfig::default();
        config.devices[1].transmit.push("Thr_FP".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Thr_FP"));
    }

    #[test]
    fn rejects_duplicate_and_surface_identities() {
        let mut config = HubConfig::default();
        config.devices[1].id = DeviceId::from("Ard_T");
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.devices[0].id = DeviceId::from("surface");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_log_level_and_empty_buffer() {
        let mut config = HubConfig::default();
        config.logging.level = "chatty".into();
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.surface.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_null_defaults() {
        let mut config = HubConfig::default();
        config.defaults.insert("LED_M".into(), json!({"level": null}));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defaults.LED_M"));
        assert!(config.to_toml().is_err());
    }
}

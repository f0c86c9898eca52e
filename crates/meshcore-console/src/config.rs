//! Console configuration loading from file and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use meshcore_db::DbRuntimeSettings;
use meshcore_observe::PipelineSettings;
use meshcore_radio::{
    AdapterKind, BridgeSettings, HardwareSettings, MockSettings, RadioParams, RadioPreset,
    ServiceSettings,
};
use meshcore_types::{GeoPoint, PublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Top-level console configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,

    /// Driver device, SPI and GPIO paths and LoRa parameters.
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// Synthetic traffic settings.
    #[serde(default)]
    pub mock: MockConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Adapter selection and service behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    /// `mock` or `hardware`.
    #[serde(default = "default_mode")]
    pub mode: AdapterKind,

    /// Name this node advertises and prefixes channel messages with.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Seconds an outbound message may stay pending.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Hand-off queue capacity; the oldest events are shed when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_disconnect_settle_ms")]
    pub disconnect_settle_ms: u64,

    /// Position to advertise. Both coordinates must be set.
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    /// Frame device exposed by the radio driver.
    #[serde(default = "default_device_path")]
    pub device_path: String,

    #[serde(default = "default_spi_device")]
    pub spi_device: String,

    #[serde(default = "default_gpio_chip")]
    pub gpio_chip: String,

    /// `meshcore-us`, `meshcore-eu` or `custom`. The explicit fields below
    /// override whatever the preset sets.
    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub bandwidth: Option<u32>,
    #[serde(default)]
    pub spreading_factor: Option<u8>,
    #[serde(default)]
    pub coding_rate: Option<u8>,
    #[serde(default)]
    pub tx_power: Option<i8>,
    #[serde(default)]
    pub preamble_length: Option<u16>,

    #[serde(default = "default_true")]
    pub use_dio2_rf: bool,

    #[serde(default = "default_true")]
    pub use_dio3_tcxo: bool,

    /// Public key of the attached radio (64 hex chars). When unset, a key
    /// is derived from the node name.
    #[serde(default)]
    pub identity_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockConfig {
    #[serde(default = "default_mock_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,

    /// Advertise the whole synthetic roster on connect.
    #[serde(default = "default_true")]
    pub initial_burst: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// How often `listen` pumps the event store.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_pump_budget_ms")]
    pub pump_budget_ms: u64,

    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,

    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default = "default_max_packets")]
    pub max_packets: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "meshcore_radio=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_mode() -> AdapterKind {
    AdapterKind::Mock
}

fn default_node_name() -> String {
    "meshcore-console".to_string()
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_disconnect_settle_ms() -> u64 {
    2_000
}

fn default_device_path() -> String {
    "/dev/meshcore0".to_string()
}

fn default_spi_device() -> String {
    "/dev/spidev1.0".to_string()
}

fn default_gpio_chip() -> String {
    "/dev/gpiochip0".to_string()
}

fn default_preset() -> String {
    RadioPreset::MeshcoreUs.as_str().to_string()
}

fn default_true() -> bool {
    true
}

fn default_mock_interval_ms() -> u64 {
    5_000
}

fn default_ack_delay_ms() -> u64 {
    1_500
}

fn default_db_path() -> String {
    "meshcore.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_acquire_timeout_ms() -> u64 {
    DbRuntimeSettings::default().acquire_timeout_ms
}

fn default_tick_ms() -> u64 {
    250
}

fn default_pump_budget_ms() -> u64 {
    50
}

fn default_max_commit_attempts() -> u32 {
    3
}

fn default_max_events() -> usize {
    500
}

fn default_max_packets() -> u32 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            node_name: default_node_name(),
            send_timeout_secs: default_send_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            disconnect_settle_ms: default_disconnect_settle_ms(),
            latitude: None,
            longitude: None,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            spi_device: default_spi_device(),
            gpio_chip: default_gpio_chip(),
            preset: default_preset(),
            frequency: None,
            bandwidth: None,
            spreading_factor: None,
            coding_rate: None,
            tx_power: None,
            preamble_length: None,
            use_dio2_rf: true,
            use_dio3_tcxo: true,
            identity_key: None,
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_mock_interval_ms(),
            ack_delay_ms: default_ack_delay_ms(),
            initial_burst: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            pump_budget_ms: default_pump_budget_ms(),
            max_commit_attempts: default_max_commit_attempts(),
            max_events: default_max_events(),
            max_packets: default_max_packets(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            node_name: self.radio.node_name.clone(),
            send_timeout: Duration::from_secs(self.radio.send_timeout_secs),
            disconnect_settle: Duration::from_millis(self.radio.disconnect_settle_ms),
            location: self.advert_location(),
            bridge: BridgeSettings {
                queue_capacity: self.radio.queue_capacity.max(1),
                backoff_base: Duration::from_millis(self.radio.backoff_base_ms),
                backoff_max: Duration::from_millis(self.radio.backoff_max_ms),
            },
        }
    }

    fn advert_location(&self) -> Option<GeoPoint> {
        match (self.radio.latitude, self.radio.longitude) {
            (Some(latitude), Some(longitude))
                if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) =>
            {
                Some(GeoPoint {
                    latitude,
                    longitude,
                })
            }
            (None, None) => None,
            (latitude, longitude) => {
                tracing::warn!(?latitude, ?longitude, "ignoring incomplete or out of range advert position");
                None
            }
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            pump_budget: Duration::from_millis(self.pipeline.pump_budget_ms),
            max_commit_attempts: self.pipeline.max_commit_attempts.max(1),
            max_events: self.pipeline.max_events,
            max_packets: self.pipeline.max_packets,
        }
    }

    pub fn db_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.database.busy_timeout_ms,
            pool_max_size: self.database.pool_max_size,
            acquire_timeout_ms: self.database.acquire_timeout_ms,
        }
    }

    pub fn mock_settings(&self) -> MockSettings {
        MockSettings {
            node_name: self.radio.node_name.clone(),
            interval: Duration::from_millis(self.mock.interval_ms),
            ack_delay: Duration::from_millis(self.mock.ack_delay_ms),
            initial_burst: self.mock.initial_burst,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.pipeline.tick_ms.max(1))
    }

    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an unknown preset, an incomplete
    /// custom parameter set or a malformed identity key.
    pub fn hardware_settings(&self) -> Result<HardwareSettings, ConfigError> {
        Ok(HardwareSettings {
            device_path: PathBuf::from(&self.hardware.device_path),
            spi_device: PathBuf::from(&self.hardware.spi_device),
            gpio_chip: PathBuf::from(&self.hardware.gpio_chip),
            radio: self.hardware.radio_params()?,
            use_dio2_rf: self.hardware.use_dio2_rf,
            use_dio3_tcxo: self.hardware.use_dio3_tcxo,
            identity: self.identity()?,
        })
    }

    /// The configured radio identity, or one derived from the node name.
    pub fn identity(&self) -> Result<PublicKey, ConfigError> {
        match self.hardware.identity_key.as_deref() {
            Some(hex) => hex.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "hardware.identity_key",
                reason: "expected 64 hex characters".into(),
            }),
            None => {
                let digest = Sha256::digest(format!("meshcore-node:{}", self.radio.node_name));
                let mut key = [0u8; PublicKey::LEN];
                key.copy_from_slice(&digest);
                Ok(PublicKey::from_bytes(key))
            }
        }
    }
}

impl HardwareConfig {
    /// Preset parameters with any explicit fields applied on top.
    pub fn radio_params(&self) -> Result<RadioParams, ConfigError> {
        let mut params = if self.preset.trim().eq_ignore_ascii_case("custom") {
            let missing = |name: &str| ConfigError::Invalid {
                field: "hardware",
                reason: format!("custom preset requires `{name}`"),
            };
            RadioParams {
                frequency: self.frequency.ok_or_else(|| missing("frequency"))?,
                bandwidth: self.bandwidth.ok_or_else(|| missing("bandwidth"))?,
                spreading_factor: self
                    .spreading_factor
                    .ok_or_else(|| missing("spreading_factor"))?,
                coding_rate: self.coding_rate.ok_or_else(|| missing("coding_rate"))?,
                tx_power: 22,
                preamble_length: 17,
            }
        } else {
            self.preset
                .parse::<RadioPreset>()
                .map_err(|e| ConfigError::Invalid {
                    field: "hardware.preset",
                    reason: e.to_string(),
                })?
                .params()
        };

        if let Some(v) = self.frequency {
            params.frequency = v;
        }
        if let Some(v) = self.bandwidth {
            params.bandwidth = v;
        }
        if let Some(v) = self.spreading_factor {
            params.spreading_factor = v;
        }
        if let Some(v) = self.coding_rate {
            params.coding_rate = v;
        }
        if let Some(v) = self.tx_power {
            params.tx_power = v;
        }
        if let Some(v) = self.preamble_length {
            params.preamble_length = v;
        }

        if !(5..=12).contains(&params.spreading_factor) {
            return Err(ConfigError::Invalid {
                field: "hardware.spreading_factor",
                reason: format!("{} is outside 5..=12", params.spreading_factor),
            });
        }
        if !(5..=8).contains(&params.coding_rate) {
            return Err(ConfigError::Invalid {
                field: "hardware.coding_rate",
                reason: format!("{} is outside 5..=8", params.coding_rate),
            });
        }
        Ok(params)
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `MESHCORE_MODE` overrides `radio.mode` (`mock` or `hardware`)
/// - `MESHCORE_NODE_NAME` overrides `radio.node_name`
/// - `MESHCORE_DB_PATH` overrides `database.path`
/// - `MESHCORE_DEVICE` overrides `hardware.device_path`
/// - `MESHCORE_USE_DIO2_RF` overrides `hardware.use_dio2_rf`
/// - `MESHCORE_USE_DIO3_TCXO` overrides `hardware.use_dio3_tcxo`
/// - `MESHCORE_LOG_LEVEL` overrides `logging.level`
/// - `MESHCORE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Applies `MESHCORE_*` overrides read through `lookup`. Unparseable
/// values are ignored with a warning.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(mode) = lookup("MESHCORE_MODE") {
        match mode.parse() {
            Ok(parsed) => config.radio.mode = parsed,
            Err(e) => tracing::warn!(error = %e, "ignoring MESHCORE_MODE"),
        }
    }
    if let Some(name) = lookup("MESHCORE_NODE_NAME").filter(|v| !v.trim().is_empty()) {
        config.radio.node_name = name.trim().to_string();
    }
    if let Some(db_path) = lookup("MESHCORE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(device) = lookup("MESHCORE_DEVICE") {
        config.hardware.device_path = device;
    }
    if let Some(flag) = lookup("MESHCORE_USE_DIO2_RF") {
        config.hardware.use_dio2_rf = is_truthy(&flag);
    }
    if let Some(flag) = lookup("MESHCORE_USE_DIO3_TCXO") {
        config.hardware.use_dio3_tcxo = is_truthy(&flag);
    }
    if let Some(level) = lookup("MESHCORE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("MESHCORE_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

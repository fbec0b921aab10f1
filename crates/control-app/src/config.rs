use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use modbus_client::{ClientConfig, TransportKind};
use rtu_codec::HOLDING_REGISTER_BASE;
use schedule::{ScheduleLayout, DEFAULT_BASE_REGISTER};
use types::DeviceIdentity;

const DEFAULT_JOURNAL_PATH: &str = "solplanet-journal.sqlite";
const DEFAULT_JOURNAL_KEEP: i64 = 1_000;
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub modbus: ClientConfig,
    /// Batteries addressable by serial number.
    pub batteries: Vec<DeviceIdentity>,
    pub schedule_base_register: u16,
    pub journal_path: String,
    pub journal_keep: i64,
    pub http_bind: String,
}

impl ControlConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.modbus.host.trim().is_empty() {
            anyhow::bail!("modbus.host must be non-empty");
        }
        if self.modbus.port == 0 {
            anyhow::bail!("modbus.port must be between 1 and 65535");
        }
        if let Some(max_batch) = self.modbus.max_batch_size {
            if max_batch == 0 {
                anyhow::bail!("modbus.max_batch_size must be >= 1");
            }
        }
        if self.modbus.timeout_ms == 0 {
            anyhow::bail!("modbus.timeout_ms must be >= 1");
        }
        if self.modbus.retry_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_backoff_ms must be >= 1");
        }
        if self.modbus.retry_max_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_max_backoff_ms must be >= 1");
        }
        if let Some(delay) = self.modbus.inter_read_delay_ms {
            if delay == 0 {
                anyhow::bail!("modbus.inter_read_delay_ms must be >= 1 when set");
            }
        }

        let mut serials = HashSet::new();
        for battery in &self.batteries {
            if battery.isn.trim().is_empty() {
                anyhow::bail!("batteries[].isn must be non-empty");
            }
            if battery.device_address == 0 {
                anyhow::bail!("battery {} device_address must be between 1 and 255", battery.isn);
            }
            if !serials.insert(battery.isn.as_str()) {
                anyhow::bail!("battery {} is configured more than once", battery.isn);
            }
        }

        if self.schedule_base_register < HOLDING_REGISTER_BASE {
            anyhow::bail!("schedule.base_register must be >= {HOLDING_REGISTER_BASE}");
        }
        ScheduleLayout::new(self.schedule_base_register)
            .context("schedule.base_register is out of range")?;

        if self.journal_path.trim().is_empty() {
            anyhow::bail!("journal.path must be non-empty");
        }
        if self.journal_keep <= 0 {
            anyhow::bail!("journal.keep must be >= 1");
        }
        self.http_bind
            .parse::<SocketAddr>()
            .with_context(|| format!("http.bind {:?} must be a socket address", self.http_bind))?;

        Ok(())
    }

    pub fn battery(&self, isn: &str) -> Option<&DeviceIdentity> {
        self.batteries.iter().find(|battery| battery.isn == isn)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            modbus: ClientConfig::default(),
            batteries: Vec::new(),
            schedule_base_register: DEFAULT_BASE_REGISTER,
            journal_path: DEFAULT_JOURNAL_PATH.to_string(),
            journal_keep: DEFAULT_JOURNAL_KEEP,
            http_bind: DEFAULT_HTTP_BIND.to_string(),
        }
    }
}

fn apply_env_overrides(config: &mut ControlConfig) -> Result<()> {
    if let Ok(value) = env::var("SOLPLANET_HOST") {
        config.modbus.host = value;
    }

    if let Some(port) = parse_env_u16("SOLPLANET_PORT") {
        config.modbus.port = port;
    }

    if let Ok(value) = env::var("SOLPLANET_TRANSPORT") {
        config.modbus.transport = value
            .parse::<TransportKind>()
            .map_err(|err| anyhow::anyhow!("SOLPLANET_TRANSPORT: {err}"))?;
    }

    if let Some(timeout_ms) = parse_env_u64("SOLPLANET_TIMEOUT_MS") {
        config.modbus.timeout_ms = timeout_ms;
    }

    if let Some(retry_count) = parse_env_usize("SOLPLANET_RETRY_COUNT") {
        config.modbus.retry_count = retry_count;
    }

    if let Ok(value) = env::var("SOLPLANET_BATTERIES") {
        config.batteries = parse_batteries(&value)?;
    }

    config.schedule_base_register =
        parse_env_u16("SOLPLANET_SCHEDULE_BASE").unwrap_or(config.schedule_base_register);

    if let Ok(value) = env::var("SOLPLANET_JOURNAL_PATH") {
        config.journal_path = value;
    }

    config.journal_keep = parse_env_i64("SOLPLANET_JOURNAL_KEEP").unwrap_or(config.journal_keep);

    if let Ok(value) = env::var("SOLPLANET_HTTP_BIND") {
        config.http_bind = value;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    modbus: Option<FileModbusConfig>,
    batteries: Option<Vec<FileBatteryConfig>>,
    schedule: Option<FileScheduleConfig>,
    journal: Option<FileJournalConfig>,
    http: Option<FileHttpConfig>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    host: Option<String>,
    port: Option<u16>,
    transport: Option<TransportKind>,
    max_batch_size: Option<u16>,
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    inter_read_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileBatteryConfig {
    isn: String,
    device_address: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct FileScheduleConfig {
    base_register: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct FileJournalConfig {
    path: Option<String>,
    keep: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileHttpConfig {
    bind: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("SOLPLANET_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content =
        fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut ControlConfig, file: FileConfig) {
    if let Some(modbus) = file.modbus {
        if let Some(host) = modbus.host {
            config.modbus.host = host;
        }
        if let Some(port) = modbus.port {
            config.modbus.port = port;
        }
        if let Some(transport) = modbus.transport {
            config.modbus.transport = transport;
        }
        if let Some(max_batch) = modbus.max_batch_size {
            config.modbus.max_batch_size = Some(max_batch);
        }
        if let Some(timeout_ms) = modbus.timeout_ms {
            config.modbus.timeout_ms = timeout_ms;
        }
        if let Some(retry_count) = modbus.retry_count {
            config.modbus.retry_count = retry_count;
        }
        if let Some(backoff) = modbus.retry_backoff_ms {
            config.modbus.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = modbus.retry_max_backoff_ms {
            config.modbus.retry_max_backoff_ms = max_backoff;
        }
        if let Some(delay) = modbus.inter_read_delay_ms {
            config.modbus.inter_read_delay_ms = Some(delay);
        }
    }

    if let Some(batteries) = file.batteries {
        config.batteries = batteries
            .into_iter()
            .map(|battery| DeviceIdentity {
                isn: battery.isn,
                device_address: battery.device_address.unwrap_or(1),
            })
            .collect();
    }

    if let Some(schedule) = file.schedule {
        if let Some(base) = schedule.base_register {
            config.schedule_base_register = base;
        }
    }

    if let Some(journal) = file.journal {
        if let Some(path) = journal.path {
            config.journal_path = path;
        }
        if let Some(keep) = journal.keep {
            config.journal_keep = keep;
        }
    }

    if let Some(http) = file.http {
        if let Some(bind) = http.bind {
            config.http_bind = bind;
        }
    }
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_i64(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Parses `isn:address,isn:address`. A missing address defaults to 1.
pub fn parse_batteries(value: &str) -> Result<Vec<DeviceIdentity>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (isn, address) = match entry.split_once(':') {
                Some((isn, address)) => (
                    isn,
                    address
                        .trim()
                        .parse::<u8>()
                        .with_context(|| format!("battery {isn} has invalid device address"))?,
                ),
                None => (entry, 1),
            };
            Ok(DeviceIdentity {
                isn: isn.trim().to_string(),
                device_address: address,
            })
        })
        .collect()
}

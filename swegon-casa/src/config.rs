//! Connection and polling configuration.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_SLAVE_ID: u8 = 1;
/// Seconds.
pub const DEFAULT_SCAN_INTERVAL: u64 = 300;
/// Seconds.
pub const DEFAULT_SCAN_INTERVAL_FAST: u64 = 5;

const SCAN_INTERVAL_BOUNDS: (u64, u64) = (5, 999);
const SCAN_INTERVAL_FAST_BOUNDS: (u64, u64) = (1, 999);

/// Prefix of the environment variables overriding file settings, e.g. `SWEGON_HOST`.
pub const ENV_PREFIX: &str = "SWEGON_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceModel {
    #[default]
    #[serde(rename = "CASA R4")]
    CasaR4,
    #[serde(rename = "CASA R15")]
    CasaR15,
    #[serde(rename = "CASA R5H")]
    CasaR5H,
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CasaR4 => "CASA R4",
            Self::CasaR15 => "CASA R15",
            Self::CasaR5H => "CASA R5H",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Name of the unit shown to users.
    pub name: String,
    pub device_model: DeviceModel,
    pub host: String,
    pub port: u16,
    pub slave_id: u8,
    /// Normal polling interval in seconds.
    pub scan_interval: u64,
    /// Polling interval in seconds for a short while after a write.
    pub scan_interval_fast: u64,
    /// Per request, connect included.
    pub io_timeout_secs: u64,
    /// Upper bound of a whole refresh cycle.
    pub cycle_timeout_secs: u64,
    /// Minimum age of the setpoints before they are read again.
    pub setpoint_refresh_secs: u64,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            name: "Swegon CASA".to_string(),
            device_model: DeviceModel::default(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            slave_id: DEFAULT_SLAVE_ID,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            scan_interval_fast: DEFAULT_SCAN_INTERVAL_FAST,
            io_timeout_secs: 3,
            cycle_timeout_secs: 20,
            setpoint_refresh_secs: 3 * 60 * 60,
        }
    }
}

impl UnitConfig {
    /// Load configuration from defaults, an optional TOML file and `SWEGON_*` variables,
    /// in increasing priority.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| Error::Config(format!("failed to load configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".to_string()));
        }
        check_bounds("scan_interval", self.scan_interval, SCAN_INTERVAL_BOUNDS)?;
        check_bounds(
            "scan_interval_fast",
            self.scan_interval_fast,
            SCAN_INTERVAL_FAST_BOUNDS,
        )?;
        for (name, secs) in [
            ("io_timeout_secs", self.io_timeout_secs),
            ("cycle_timeout_secs", self.cycle_timeout_secs),
            ("setpoint_refresh_secs", self.setpoint_refresh_secs),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn scan_interval_fast(&self) -> Duration {
        Duration::from_secs(self.scan_interval_fast)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn setpoint_refresh(&self) -> Duration {
        Duration::from_secs(self.setpoint_refresh_secs)
    }
}

fn check_bounds(name: &str, value: u64, (min, max): (u64, u64)) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{name} must be within {min}..={max}, got {value}"
        )))
    }
}

//! Runtime configuration.
//!
//! Every knob has a default matching the kernel interfaces on a stock
//! board, so `Config::default()` is what most callers want. A TOML file or
//! `SBC_GPIO_*` environment variables can override individual fields.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

pub const DEFAULT_CONSUMER: &str = "sbc-gpio";
pub const DEFAULT_PWM_SYSFS_ROOT: &str = "/sys/class/pwm";
pub const DEFAULT_PWM_GROUP: &str = "gpio";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consumer label attached to every line request.
    pub consumer: String,
    pub pwm: PwmConfig,
    pub edge: EdgeConfig,
    pub soft_pwm: SoftPwmConfig,
}

/// Hardware PWM sysfs layout and export handshake policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PwmConfig {
    pub sysfs_root: PathBuf,
    pub export_attempts: u32,
    pub export_interval_ms: u64,
    pub permission_attempts: u32,
    pub permission_interval_ms: u64,
    /// Group expected to own the PWM sysfs files after udev fixup.
    pub privileged_group: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub poll_interval_us: u64,
    pub stream_wait_ms: u64,
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SoftPwmConfig {
    pub tick_interval_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consumer: DEFAULT_CONSUMER.to_string(),
            pwm: PwmConfig::default(),
            edge: EdgeConfig::default(),
            soft_pwm: SoftPwmConfig::default(),
        }
    }
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_PWM_SYSFS_ROOT),
            export_attempts: 10,
            export_interval_ms: 10,
            permission_attempts: 50,
            permission_interval_ms: 20,
            privileged_group: DEFAULT_PWM_GROUP.to_string(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 1_000,
            stream_wait_ms: 100,
            buffer_capacity: 16,
        }
    }
}

impl Default for SoftPwmConfig {
    fn default() -> Self {
        Self {
            tick_interval_us: 1_000,
        }
    }
}

impl PwmConfig {
    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }

    pub fn permission_interval(&self) -> Duration {
        Duration::from_millis(self.permission_interval_ms)
    }
}

impl EdgeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }

    pub fn stream_wait(&self) -> Duration {
        Duration::from_millis(self.stream_wait_ms)
    }
}

impl SoftPwmConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(self.tick_interval_us.max(1))
    }
}

impl Config {
    /// Loads a configuration file. Missing fields keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults with `SBC_GPIO_CONSUMER`, `SBC_GPIO_PWM_SYSFS` and
    /// `SBC_GPIO_PWM_GROUP` applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(consumer) = env::var("SBC_GPIO_CONSUMER") {
            self.consumer = consumer;
        }
        if let Ok(root) = env::var("SBC_GPIO_PWM_SYSFS") {
            self.pwm.sysfs_root = PathBuf::from(root);
        }
        if let Ok(group) = env::var("SBC_GPIO_PWM_GROUP") {
            self.pwm.privileged_group = group;
        }
        self
    }
}

//! Configuration of the monitor, its instances and the crash reporter.
//!
//! Loaded from a toml file; every field has a default, so an empty file is valid:
//!
//! ```toml
//! [monitor]
//! context_window = 200
//! tick_interval_ms = 1000
//! no_output_timeout_ms = 5000
//! finalize_grace_ms = 3000
//!
//! [instance]
//! count = 1
//! diagnose = "cat /proc/meminfo"
//!
//! [instance.ssh]
//! addr = "127.0.0.1"
//! port = 10022
//! key = "./stretch.id_rsa"
//!
//! [reporter]
//! symbolizer = "./bin/syz-symbolize"
//! ```

use crate::report::ReportConfig;
use crate::vm::ssh::SshConfig;
use serde::{Deserialize, Deserializer};
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub instance: InstanceConfig,
    pub reporter: ReportConfig,
}

/// Tunables of the execution monitor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Bytes kept before a crash line in the report.
    pub context_window: usize,
    /// Period of the liveness re-check.
    #[serde(rename = "tick_interval_ms", deserialize_with = "millis")]
    pub tick_interval: Duration,
    /// Run is considered hung after this long without a liveness marker.
    #[serde(rename = "no_output_timeout_ms", deserialize_with = "millis")]
    pub no_output_timeout: Duration,
    /// Extra wait for delayed evidence before a verdict is sealed.
    #[serde(rename = "finalize_grace_ms", deserialize_with = "millis")]
    pub finalize_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            context_window: 200,
            tick_interval: Duration::from_secs(1),
            no_output_timeout: Duration::from_secs(5),
            finalize_grace: Duration::from_secs(3),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

impl MonitorConfig {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.tick_interval.as_millis() == 0 {
            return Err(ConfigError::Invalid("zero tick interval".to_string()));
        }
        if self.no_output_timeout < self.tick_interval {
            return Err(ConfigError::Invalid(format!(
                "no output timeout ({:?}) shorter than tick interval ({:?})",
                self.no_output_timeout, self.tick_interval
            )));
        }
        if self.finalize_grace.as_millis() == 0 {
            return Err(ConfigError::Invalid("zero finalize grace".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceConfig {
    /// Number of instances the pool hands out.
    pub count: usize,
    /// Working directory of local commands.
    pub workdir: PathBuf,
    /// Diagnose command, run when the machine is lost.
    pub diagnose: Option<String>,
    /// Run over ssh instead of locally.
    pub ssh: Option<SshConfig>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            count: 1,
            workdir: PathBuf::from("."),
            diagnose: None,
            ssh: None,
        }
    }
}

impl InstanceConfig {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::Invalid("zero instance count".to_string()));
        }
        if !self.workdir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "bad workdir: {}",
                self.workdir.display()
            )));
        }
        if let Some(ssh) = self.ssh.as_ref() {
            ssh.check().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        self.monitor.check()?;
        self.instance.check()?;
        self.reporter.check().map_err(ConfigError::Invalid)
    }
}

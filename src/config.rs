//! Configuration for the exporter.
//!
//! Supports YAML configuration with precedence: CLI > file > defaults.
//! The metric family selection is resolved here, before any scrape runs.

use crate::error::{ExporterError, Result};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default TCP port of the HTTP endpoint.
pub const DEFAULT_PORT: u16 = 9400;

/// Global configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Omit `# HELP` / `# TYPE` lines.
    #[serde(default)]
    pub compact: bool,

    /// Emit per-collector scrape durations.
    #[serde(default = "default_scrape_time")]
    pub scrape_time: bool,

    /// Emit the total scrape duration as `collector="all"`.
    #[serde(default = "default_scrape_time")]
    pub scrape_time_all: bool,

    /// HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address; all interfaces if unset.
    #[serde(default)]
    pub source: Option<String>,

    /// Log verbosity (TRACE, DEBUG, INFO, WARN, ERROR, FATAL).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Append log output to this file instead of stderr.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

fn default_scrape_time() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    LogLevel::Info.to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            compact: false,
            scrape_time: default_scrape_time(),
            scrape_time_all: default_scrape_time(),
            port: default_port(),
            source: None,
            log_level: default_log_level(),
            logfile: None,
        }
    }
}

/// Metric family selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Families that are never collected.
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Global settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Metric family selection.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            global: GlobalConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location: `<config_dir>/nvmex/config.yaml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nvmex").join("config.yaml"))
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .map_err(|_| ExporterError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error with line number if parsing fails.
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml).map_err(|e| {
            let line = e.location().map(|l| l.line()).unwrap_or(0);
            ExporterError::ConfigParse { line, message: e.to_string() }
        })
    }

    /// Parsed log level.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::ConfigInvalid`] for an unknown level.
    pub fn log_level(&self) -> Result<LogLevel> {
        self.global.log_level.parse()
    }

    /// Resolves `metrics.disabled` into a selection.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::UnknownMetric`] listing every unknown name.
    pub fn selection(&self) -> Result<MetricSelection> {
        let mut selection = MetricSelection::all();
        selection.disable_names(self.metrics.disabled.iter().map(String::as_str))?;
        if !self.global.scrape_time {
            selection.disable(MetricToggle::ScrapeTime);
        }
        Ok(selection)
    }
}

// ============================================================================
// Metric family toggles
// ============================================================================

/// A family (or sub-mode) that can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricToggle {
    /// Exporter, driver and library versions.
    Version,
    /// The exporter's own CPU, memory, descriptors and start time.
    Process,
    /// Per-device name, bus and UUID.
    GpuInfo,
    /// Clocks and throttle reasons.
    Clock,
    /// BAR1 memory.
    Bar1Mem,
    /// Temperatures and thresholds.
    Temperature,
    /// Energy, power draw and limits.
    Power,
    /// Fan speed.
    Fan,
    /// Engine utilisation.
    Utilization,
    /// PCIe throughput and link.
    Pcie,
    /// Performance policy violations.
    Violation,
    /// Device memory.
    Memory,
    /// ECC mode, errors, retired pages and remapped rows.
    Ecc,
    /// NVLink.
    NvLink,
    /// Encoder statistics.
    EncStat,
    /// Encoder sessions.
    EncSession,
    /// Frame capture statistics.
    FbcStat,
    /// Frame capture sessions.
    FbcSession,
    /// Per-collector scrape durations.
    ScrapeTime,
}

impl MetricToggle {
    /// All toggles.
    pub const ALL: [MetricToggle; 19] = [
        Self::Version,
        Self::Process,
        Self::GpuInfo,
        Self::Clock,
        Self::Bar1Mem,
        Self::Temperature,
        Self::Power,
        Self::Fan,
        Self::Utilization,
        Self::Pcie,
        Self::Violation,
        Self::Memory,
        Self::Ecc,
        Self::NvLink,
        Self::EncStat,
        Self::EncSession,
        Self::FbcStat,
        Self::FbcSession,
        Self::ScrapeTime,
    ];

    /// Name used in configuration files and on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Process => "process",
            Self::GpuInfo => "gpuinfo",
            Self::Clock => "clock",
            Self::Bar1Mem => "bar1mem",
            Self::Temperature => "temperature",
            Self::Power => "power",
            Self::Fan => "fan",
            Self::Utilization => "utilization",
            Self::Pcie => "pcie",
            Self::Violation => "violation",
            Self::Memory => "memory",
            Self::Ecc => "ecc",
            Self::NvLink => "nvlink",
            Self::EncStat => "encstat",
            Self::EncSession => "encsession",
            Self::FbcStat => "fbcstat",
            Self::FbcSession => "fbcsession",
            Self::ScrapeTime => "scrapetime",
        }
    }

    fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for MetricToggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricToggle {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ExporterError::UnknownMetric(s.to_string()))
    }
}

/// Set of enabled toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSelection(u32);

impl MetricSelection {
    /// Everything enabled.
    #[must_use]
    pub fn all() -> Self {
        Self(MetricToggle::ALL.iter().fold(0, |acc, t| acc | t.bit()))
    }

    /// Nothing enabled.
    #[must_use]
    pub fn none() -> Self {
        Self(0)
    }

    /// Whether `toggle` is enabled.
    #[must_use]
    pub fn is_enabled(&self, toggle: MetricToggle) -> bool {
        self.0 & toggle.bit() != 0
    }

    /// Enables `toggle`.
    pub fn enable(&mut self, toggle: MetricToggle) {
        self.0 |= toggle.bit();
    }

    /// Disables `toggle`.
    pub fn disable(&mut self, toggle: MetricToggle) {
        self.0 &= !toggle.bit();
    }

    /// Disables every named family. Nothing is changed if any name is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::UnknownMetric`] listing all unknown names.
    pub fn disable_names<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let mut toggles = Vec::new();
        let mut unknown = Vec::new();
        for name in names.into_iter().map(str::trim).filter(|n| !n.is_empty()) {
            match name.parse::<MetricToggle>() {
                Ok(t) => toggles.push(t),
                Err(_) => unknown.push(name),
            }
        }
        if !unknown.is_empty() {
            return Err(ExporterError::UnknownMetric(unknown.join(", ")));
        }
        for t in toggles {
            self.disable(t);
        }
        Ok(())
    }

    /// Disables the families in a comma separated list such as `"fan,nvlink"`.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::UnknownMetric`] listing all unknown names.
    pub fn disable_list(&mut self, list: &str) -> Result<()> {
        self.disable_names(list.split(','))
    }
}

impl Default for MetricSelection {
    fn default() -> Self {
        Self::all()
    }
}

//! Configuration for loaders, logging and metrics.
//!
//! Everything can be read from a single YAML file via [`Config::get`]. All fields have defaults,
//! so any subset of them can be given.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

/// An error reading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error("failed reading config file")]
    Io(#[from] io::Error),
    /// The file has no content.
    #[error("config file empty")]
    Empty,
    /// The file is not valid YAML or does not match the expected structure.
    #[error("failed to parse config YAML")]
    Parse(#[from] serde_yaml::Error),
}

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the loaders.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

/// Options of a single [`CachingLoader`](crate::CachingLoader).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Name of the loader, used in log events and as the `loader` metrics tag.
    pub name: String,
    /// Drive every new load once right away.
    ///
    /// With this set, a load function that completes without suspending settles before
    /// [`load`](crate::CachingLoader::load) returns, and a failure is already evicted from the
    /// cache by then. Loads that do suspend are driven to completion on the current tokio runtime,
    /// if any, and cached handles are polled again before they are handed out.
    ///
    /// Without it, nothing runs until the handle is first polled, and a failure is only evicted
    /// once one of its handles is polled.
    pub eager: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            name: "loader".into(),
            eager: true,
        }
    }
}

/// The complete configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the logging system.
    pub logging: Logging,
    /// Configuration of the statsd metrics.
    pub metrics: Metrics,
    /// Per-loader options, keyed by loader name.
    pub loaders: BTreeMap<String, LoaderConfig>,
}

impl Config {
    /// Reads the configuration from the YAML file at `path`, or returns the defaults.
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_reader(fs::File::open(path)?),
            None => Ok(Config::default()),
        }
    }

    /// Reads the configuration from YAML.
    pub fn from_reader(mut reader: impl io::Read) -> Result<Self, ConfigError> {
        let mut config = String::new();
        reader.read_to_string(&mut config)?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(serde_yaml::from_str(&config)?)
    }

    /// Returns the options for the loader called `name`.
    ///
    /// Loaders without an entry get the default options. The returned name is always `name`,
    /// regardless of what the entry says.
    pub fn loader(&self, name: &str) -> LoaderConfig {
        let mut config = self.loaders.get(name).cloned().unwrap_or_default();
        config.name = name.to_owned();
        config
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

//! Configuration file loading.
//!
//! The file is newline-separated `key=value` pairs; `#` comments and blank
//! lines are skipped. Unknown keys, malformed lines, and missing required
//! keys are all load failures: the relay refuses to start on a config it
//! does not fully understand.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_DNS_REFRESH_INTERVAL: u64 = 60;
const DEFAULT_HEALTH_CHECK_INTERVAL: f64 = 1.0;

/// Errors that can occur while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A non-comment line without a `=` separator.
    #[error("bad line {line} in config: \"{text}\"")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },

    /// A key this relay does not recognize.
    #[error("unknown parameter \"{key}\"")]
    UnknownKey {
        /// The offending key.
        key: String,
    },

    /// A recognized key whose value does not parse or is out of range.
    #[error("invalid value for \"{key}\": \"{value}\"")]
    InvalidValue {
        /// The key being set.
        key: String,
        /// The offending value.
        value: String,
    },

    /// A `downstream` value not shaped like `host:dataPort:healthPort`.
    #[error("invalid downstream \"{spec}\" (expected host:dataPort:healthPort)")]
    InvalidDownstream {
        /// The offending specifier.
        spec: String,
    },

    /// A required key that never appeared.
    #[error("missing required parameter \"{key}\"")]
    MissingKey {
        /// The absent key.
        key: &'static str,
    },
}

/// Log verbosity, configured as an integer 0..4.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including per-sample tracing.
    #[default]
    Trace,
    /// Per-flush and per-host state changes.
    Debug,
    /// Lifecycle events.
    Info,
    /// Abandoned probes and transient I/O failures.
    Warn,
    /// Invalid samples, lost data, fatal startup problems.
    Error,
}

impl LogLevel {
    /// Maps the configured integer onto a level; `None` when out of range.
    pub fn from_index(index: u8) -> Option<LogLevel> {
        match index {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// The `tracing` filter that suppresses everything below this level.
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// The downstream specifier: one hostname (or literal IPv4 address) plus the
/// data and health ports shared by every resolved collector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownstreamSpec {
    /// Hostname or literal IPv4 address.
    pub host: String,
    /// UDP port metrics are relayed to.
    pub data_port: u16,
    /// TCP port answering health probes.
    pub health_port: u16,
}

impl FromStr for DownstreamSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let err = || ConfigError::InvalidDownstream { spec: s.to_string() };
        let (host, ports) = s.split_once(':').ok_or_else(err)?;
        let (data_port, health_port) = ports.split_once(':').ok_or_else(err)?;
        if host.is_empty() {
            return Err(err());
        }
        Ok(DownstreamSpec {
            host: host.to_string(),
            data_port: data_port.parse().map_err(|_| err())?,
            health_port: health_port.parse().map_err(|_| err())?,
        })
    }
}

/// Relay configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// UDP port the ingress socket binds (0 picks an ephemeral port).
    pub data_port: u16,
    /// How often the active window is flushed downstream.
    pub flush_interval: Duration,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// How often the downstream hostname is re-resolved.
    pub dns_refresh_interval: Duration,
    /// How often downstream health is probed.
    pub health_check_interval: Duration,
    /// Where flushed metrics go.
    pub downstream: DownstreamSpec,
}

impl Config {
    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&text)
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut data_port = None;
        let mut flush_interval = None;
        let mut log_level = LogLevel::default();
        let mut dns_refresh_interval = Duration::from_secs(DEFAULT_DNS_REFRESH_INTERVAL);
        let mut health_check_interval = Duration::from_secs_f64(DEFAULT_HEALTH_CHECK_INTERVAL);
        let mut downstream = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine { line: lineno + 1, text: raw.to_string() });
            };
            match key {
                "data_port" => data_port = Some(parse_value(key, value)?),
                "downstream_flush_interval" => flush_interval = Some(parse_interval(key, value)?),
                "log_level" => {
                    log_level = value
                        .parse::<u8>()
                        .ok()
                        .and_then(LogLevel::from_index)
                        .ok_or_else(|| ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })?;
                }
                "dns_refresh_interval" => {
                    dns_refresh_interval = Duration::from_secs(parse_value(key, value)?);
                }
                "downstream_health_check_interval" => {
                    health_check_interval = parse_interval(key, value)?;
                }
                "downstream" => downstream = Some(value.parse()?),
                _ => return Err(ConfigError::UnknownKey { key: key.to_string() }),
            }
        }

        Ok(Config {
            data_port: data_port.ok_or(ConfigError::MissingKey { key: "data_port" })?,
            flush_interval: flush_interval
                .ok_or(ConfigError::MissingKey { key: "downstream_flush_interval" })?,
            log_level,
            dns_refresh_interval,
            health_check_interval,
            downstream: downstream.ok_or(ConfigError::MissingKey { key: "downstream" })?,
        })
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

// Intervals are fractional seconds and must be positive; a zero-period timer
// would spin the reactor.
fn parse_interval(key: &str, value: &str) -> Result<Duration, ConfigError> {
    match value.parse::<f64>() {
        Ok(seconds) if seconds > 0.0 && seconds.is_finite() => {
            Ok(Duration::from_secs_f64(seconds))
        }
        _ => Err(ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "\
# relay configuration
data_port=8125
downstream_flush_interval=2.5
log_level=2

dns_refresh_interval=120
downstream_health_check_interval=0.5
downstream=collector.internal:8125:8126
";

    #[test]
    fn parses_a_full_config() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.data_port, 8125);
        assert_eq!(config.flush_interval, Duration::from_secs_f64(2.5));
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.dns_refresh_interval, Duration::from_secs(120));
        assert_eq!(config.health_check_interval, Duration::from_secs_f64(0.5));
        assert_eq!(
            config.downstream,
            DownstreamSpec {
                host: "collector.internal".to_string(),
                data_port: 8125,
                health_port: 8126,
            }
        );
    }

    #[test]
    fn optional_keys_have_defaults() {
        let config = Config::parse(
            "data_port=8125\ndownstream_flush_interval=1\ndownstream=10.0.0.1:8125:8126\n",
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(config.dns_refresh_interval, Duration::from_secs(60));
        assert_eq!(config.health_check_interval, Duration::from_secs(1));
    }

    #[test]
    fn missing_required_keys_fail() {
        for text in [
            "downstream_flush_interval=1\ndownstream=10.0.0.1:8125:8126\n",
            "data_port=8125\ndownstream=10.0.0.1:8125:8126\n",
            "data_port=8125\ndownstream_flush_interval=1\n",
        ] {
            assert!(matches!(Config::parse(text), Err(ConfigError::MissingKey { .. })));
        }
    }

    #[test]
    fn unknown_keys_fail() {
        let result = Config::parse("data_port=8125\nmystery=1\n");
        assert!(matches!(result, Err(ConfigError::UnknownKey { .. })));
    }

    #[test]
    fn lines_without_separator_fail() {
        let result = Config::parse("data_port 8125\n");
        assert!(matches!(result, Err(ConfigError::MalformedLine { line: 1, .. })));
    }

    #[test]
    fn rejects_degenerate_intervals() {
        for value in ["0", "-1", "nan", "oops"] {
            let text = format!(
                "data_port=8125\ndownstream_flush_interval={}\ndownstream=10.0.0.1:8125:8126\n",
                value
            );
            assert!(matches!(Config::parse(&text), Err(ConfigError::InvalidValue { .. })));
        }
    }

    #[test]
    fn downstream_spec_requires_both_ports() {
        assert!("host".parse::<DownstreamSpec>().is_err());
        assert!("host:8125".parse::<DownstreamSpec>().is_err());
        assert!("host:8125:notaport".parse::<DownstreamSpec>().is_err());
        assert!(":8125:8126".parse::<DownstreamSpec>().is_err());

        let spec: DownstreamSpec = "host:8125:8126".parse().unwrap();
        assert_eq!(spec.host, "host");
        assert_eq!(spec.data_port, 8125);
        assert_eq!(spec.health_port, 8126);
    }

    #[test]
    fn log_levels_cover_the_configured_range() {
        assert_eq!(LogLevel::from_index(0), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_index(4), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_index(5), None);
        assert!(matches!(
            Config::parse("data_port=1\ndownstream_flush_interval=1\nlog_level=9\ndownstream=h:1:2\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}

//! Configuration for glcd-emu.
//!
//! Settings are read from `~/.glcd-emu/config.toml` (or a path given with
//! `--config`). Every field has a default, so a partial file is fine:
//!
//! ```toml
//! [display]
//! width = 128
//! height = 64
//! strategy = "paged"       # "paged" or "simple"
//! bit_order = "msb-first"  # "msb-first" or "lsb-first"
//! bounds = "reject"        # "reject" or "clamp"
//!
//! [connection]
//! endpoint = "127.0.0.1:3580"
//! baud_rate = 115200
//! data_bits = 8
//! parity = "none"          # none, odd, even, mark, space
//! stop_bits = "one"        # one, one-point-five, two
//! flow_control = "none"    # none, rts-cts, xon-xoff
//! connect_timeout_ms = 5000
//!
//! [handshake]
//! poll_interval_ms = 50
//! timeout_ms = 30000       # omit to wait until cancelled
//! idle_interval_ms = 1
//!
//! [log]
//! level = "info"
//! file = "/tmp/glcd-emu.log"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::glcd::{BitOrder, BoundsPolicy, PixelBuffer, SharedBuffer, StrategyKind};
use crate::core::listener::ListenerTiming;
use crate::core::options::{keys, ListenerOptions};
use crate::core::transport::{FlowControl, Parity, PortService, StopBits};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub connection: ConnectionConfig,
    pub handshake: HandshakeConfig,
    pub log: LogConfig,
}

/// Emulated display geometry and decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: usize,
    pub height: usize,
    pub strategy: StrategyKind,
    pub bit_order: BitOrder,
    pub bounds: BoundsPolicy,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 64,
            strategy: StrategyKind::Paged,
            bit_order: BitOrder::MsbFirst,
            bounds: BoundsPolicy::Reject,
        }
    }
}

/// Endpoint and line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name or `host:port`
    pub endpoint: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:3580".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            connect_timeout_ms: 5000,
        }
    }
}

/// Handshake and polling behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub poll_interval_ms: u64,
    /// `None` waits for the device until cancelled
    pub timeout_ms: Option<u64>,
    pub idle_interval_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            timeout_ms: None,
            idle_interval_ms: 1,
        }
    }
}

/// Logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
    /// Log to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load the default config file, falling back to defaults if it is
    /// missing or broken
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|e| {
                warn!("{}, using defaults", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get config file path
    pub fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".glcd-emu").join("config.toml"))
    }

    /// A fresh buffer with the configured geometry
    pub fn pixel_buffer(&self) -> SharedBuffer {
        SharedBuffer::new(PixelBuffer::with_policy(
            self.display.width,
            self.display.height,
            self.display.bounds,
        ))
    }

    pub fn timing(&self) -> ListenerTiming {
        ListenerTiming {
            poll_interval: Duration::from_millis(self.handshake.poll_interval_ms),
            handshake_timeout: self.handshake.timeout_ms.map(Duration::from_millis),
            idle_interval: Duration::from_millis(self.handshake.idle_interval_ms),
        }
    }

    /// Listener options for the configured endpoint, resolved through `service`
    pub fn to_listener_options(&self, service: Arc<dyn PortService>) -> ListenerOptions {
        let c = &self.connection;
        ListenerOptions::builder()
            .put(keys::PORT_SERVICE, service)
            .put(keys::PORT_NAME, c.endpoint.clone())
            .put(keys::BAUD_RATE, c.baud_rate)
            .put(keys::DATA_BITS, c.data_bits)
            .put(keys::PARITY, c.parity)
            .put(keys::STOP_BITS, c.stop_bits)
            .put(keys::FLOW_CONTROL, c.flow_control)
            .put(keys::CONNECT_TIMEOUT, Duration::from_millis(c.connect_timeout_ms))
            .build()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TcpPortService;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [display]
            width = 84
            height = 48
            strategy = "simple"

            [connection]
            parity = "even"
            stop_bits = "one-point-five"
            "#,
        )
        .unwrap();

        assert_eq!(config.display.width, 84);
        assert_eq!(config.display.strategy, StrategyKind::Simple);
        assert_eq!(config.display.bit_order, BitOrder::MsbFirst);
        assert_eq!(config.connection.parity, Parity::Even);
        assert_eq!(config.connection.stop_bits, StopBits::OnePointFive);
        assert_eq!(config.connection.baud_rate, 9600);
        assert_eq!(config.handshake, HandshakeConfig::default());
    }

    #[test]
    fn test_timing_conversion() {
        let mut config = Config::default();
        assert_eq!(config.timing().handshake_timeout, None);

        config.handshake.timeout_ms = Some(250);
        config.handshake.poll_interval_ms = 10;
        let timing = config.timing();
        assert_eq!(timing.handshake_timeout, Some(Duration::from_millis(250)));
        assert_eq!(timing.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_listener_options_from_config() {
        let mut config = Config::default();
        config.connection.endpoint = "10.0.0.7:4000".to_string();
        config.connection.flow_control = FlowControl::RtsCts;

        let options = config.to_listener_options(Arc::new(TcpPortService));
        assert_eq!(options.get(keys::PORT_NAME), Some("10.0.0.7:4000".to_string()));
        assert_eq!(options.get(keys::FLOW_CONTROL), Some(FlowControl::RtsCts));
        assert_eq!(options.port_settings().unwrap().connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_pixel_buffer_geometry() {
        let mut config = Config::default();
        config.display.bounds = BoundsPolicy::Clamp;
        let buffer = config.pixel_buffer();
        let buffer = buffer.read();
        assert_eq!((buffer.width(), buffer.height()), (128, 64));
        assert_eq!(buffer.policy(), BoundsPolicy::Clamp);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nlevel = \"debug\"").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "[display\nwidth = ").unwrap();
        assert!(matches!(
            Config::from_file(broken.path()),
            Err(LoadError::Parse { .. })
        ));

        assert!(matches!(
            Config::from_file(Path::new("/definitely/not/here.toml")),
            Err(LoadError::Read { .. })
        ));
    }

    #[test]
    fn test_round_trip_serialization() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(toml::from_str::<Config>(&text).unwrap(), config);
    }
}

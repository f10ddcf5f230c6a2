//! Listener options
//!
//! A typed key/value bag handed to the listener before it starts. Each key
//! carries its value type, so a key can only ever hold one kind of value.
//!
//! ```no_run
//! use std::sync::Arc;
//! use glcd_emu::core::options::{keys, ListenerOptions};
//! use glcd_emu::core::transport::{PortService, TcpPortService};
//!
//! let service: Arc<dyn PortService> = Arc::new(TcpPortService);
//! let options = ListenerOptions::builder()
//!     .put(keys::PORT_SERVICE, service)
//!     .put(keys::PORT_NAME, "192.168.1.50:3580".to_string())
//!     .put(keys::BAUD_RATE, 115_200)
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::transport::{FlowControl, Parity, PortService, PortSettings, StopBits};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required option {0}")]
    MissingOption(&'static str),

    #[error("Invalid value for {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("No port found named '{0}'")]
    PortNotFound(String),
}

/// A stored option value
#[derive(Clone)]
pub enum OptionValue {
    Int(u32),
    Byte(u8),
    Text(String),
    Duration(Duration),
    Parity(Parity),
    StopBits(StopBits),
    FlowControl(FlowControl),
    PortService(Arc<dyn PortService>),
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Byte(v) => write!(f, "{}", v),
            OptionValue::Text(v) => write!(f, "{:?}", v),
            OptionValue::Duration(v) => write!(f, "{:?}", v),
            OptionValue::Parity(v) => write!(f, "{:?}", v),
            OptionValue::StopBits(v) => write!(f, "{:?}", v),
            OptionValue::FlowControl(v) => write!(f, "{:?}", v),
            OptionValue::PortService(_) => f.write_str("<port service>"),
        }
    }
}

/// Types that can be stored in [`ListenerOptions`]
pub trait OptionType: Sized {
    fn into_value(self) -> OptionValue;
    fn from_value(value: &OptionValue) -> Option<Self>;
}

macro_rules! option_type {
    ($ty:ty, $variant:ident) => {
        impl OptionType for $ty {
            fn into_value(self) -> OptionValue {
                OptionValue::$variant(self)
            }

            fn from_value(value: &OptionValue) -> Option<Self> {
                match value {
                    OptionValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

option_type!(u32, Int);
option_type!(u8, Byte);
option_type!(String, Text);
option_type!(Duration, Duration);
option_type!(Parity, Parity);
option_type!(StopBits, StopBits);
option_type!(FlowControl, FlowControl);
option_type!(Arc<dyn PortService>, PortService);

/// A typed option key
pub struct ListenerOption<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ListenerOption<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ListenerOption<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ListenerOption<T> {}

impl<T> fmt::Debug for ListenerOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Well-known option keys
pub mod keys {
    use super::*;

    /// Resolves the endpoint name into a transport
    pub const PORT_SERVICE: ListenerOption<Arc<dyn PortService>> = ListenerOption::new("PORT_SERVICE");
    /// Serial port name or `host:port`
    pub const PORT_NAME: ListenerOption<String> = ListenerOption::new("PORT_NAME");
    pub const BAUD_RATE: ListenerOption<u32> = ListenerOption::new("BAUD_RATE");
    pub const PARITY: ListenerOption<Parity> = ListenerOption::new("PARITY");
    pub const FLOW_CONTROL: ListenerOption<FlowControl> = ListenerOption::new("FLOW_CONTROL");
    pub const STOP_BITS: ListenerOption<StopBits> = ListenerOption::new("STOP_BITS");
    pub const DATA_BITS: ListenerOption<u8> = ListenerOption::new("DATA_BITS");
    /// Network endpoints only
    pub const CONNECT_TIMEOUT: ListenerOption<Duration> = ListenerOption::new("CONNECT_TIMEOUT");
}

/// Immutable option set
#[derive(Clone, Default)]
pub struct ListenerOptions {
    values: BTreeMap<&'static str, OptionValue>,
}

impl ListenerOptions {
    pub fn builder() -> ListenerOptionsBuilder {
        ListenerOptionsBuilder::default()
    }

    pub fn get<T: OptionType>(&self, key: ListenerOption<T>) -> Option<T> {
        self.values.get(key.name).and_then(T::from_value)
    }

    pub fn get_or<T: OptionType>(&self, key: ListenerOption<T>, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn require<T: OptionType>(&self, key: ListenerOption<T>) -> Result<T, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingOption(key.name))
    }

    pub fn contains<T>(&self, key: ListenerOption<T>) -> bool {
        self.values.contains_key(key.name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.keys().copied()
    }

    /// Collect and validate the line settings, filling in defaults for
    /// anything not given
    pub fn port_settings(&self) -> Result<PortSettings, ConfigError> {
        let defaults = PortSettings::default();
        let settings = PortSettings {
            baud_rate: self.get_or(keys::BAUD_RATE, defaults.baud_rate),
            data_bits: self.get_or(keys::DATA_BITS, defaults.data_bits),
            parity: self.get_or(keys::PARITY, defaults.parity),
            stop_bits: self.get_or(keys::STOP_BITS, defaults.stop_bits),
            flow_control: self.get_or(keys::FLOW_CONTROL, defaults.flow_control),
            connect_timeout: self.get_or(keys::CONNECT_TIMEOUT, defaults.connect_timeout),
        };

        if settings.baud_rate == 0 {
            return Err(ConfigError::InvalidOption {
                option: keys::BAUD_RATE.name(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(5..=8).contains(&settings.data_bits) {
            return Err(ConfigError::InvalidOption {
                option: keys::DATA_BITS.name(),
                reason: format!("{} is not between 5 and 8", settings.data_bits),
            });
        }
        Ok(settings)
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

impl fmt::Display for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{} = {:?}", name, value)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ListenerOptionsBuilder {
    values: BTreeMap<&'static str, OptionValue>,
}

impl ListenerOptionsBuilder {
    pub fn put<T: OptionType>(mut self, key: ListenerOption<T>, value: T) -> Self {
        self.values.insert(key.name, value.into_value());
        self
    }

    pub fn build(self) -> ListenerOptions {
        ListenerOptions { values: self.values }
    }
}

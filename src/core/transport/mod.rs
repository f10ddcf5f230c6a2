//! Transport capability
//!
//! The listener never talks to ports directly. A [`PortService`] resolves an
//! endpoint name into a [`Transport`], a byte-stream handle the listener
//! opens, polls and closes.
//!
//! - **tcp**: network endpoints (`host:port`)
//! - **memory**: in-process pipe, used for tests and the demo
//!
//! Serial hardware providers live outside this crate and plug in by
//! implementing [`PortService`] with the settings in [`PortSettings`].

pub mod memory;
pub mod tcp;

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use memory::{MemoryPeer, MemoryPortService, MemoryTransport};
pub use tcp::{TcpPortService, TcpTransport};

/// Serial parity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Serial flow control
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowControl {
    #[default]
    None,
    RtsCts,
    XonXoff,
}

/// Line settings handed to the port service when resolving an endpoint.
/// Serial providers use the line parameters, network providers the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    pub connect_timeout: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Display for PortSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Baudrate={}, DataBits={}, StopBits={:?}, Parity={:?}, Flow Control={:?}",
            self.baud_rate, self.data_bits, self.stop_bits, self.parity, self.flow_control
        )
    }
}

/// A byte-stream handle
pub trait Transport: Send {
    /// Human readable endpoint name
    fn name(&self) -> &str;

    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    /// Bytes that can be read without blocking. An error means the
    /// connection is gone.
    fn bytes_available(&mut self) -> io::Result<usize>;

    fn read_byte(&mut self) -> io::Result<u8>;

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Resolves endpoint names into transports
pub trait PortService: Send + Sync {
    /// Look up an endpoint, `None` if it cannot be resolved
    fn find_port(&self, name: &str, settings: &PortSettings) -> Option<Box<dyn Transport>>;
}

pub(crate) fn not_open(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("{} is not open", name))
}

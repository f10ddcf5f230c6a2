//! TCP transport
//!
//! Connects to a device (or a serial-to-network bridge) at `host:port`.
//! The stream is kept non-blocking so availability can be probed with a
//! peek, writes switch back to blocking for their duration.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use super::{not_open, PortService, PortSettings, Transport};

const PEEK_SIZE: usize = 512;

pub struct TcpTransport {
    name: String,
    addr: SocketAddr,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(name: impl Into<String>, addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            addr,
            connect_timeout,
            stream: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(not_open(&self.name)),
        }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        debug!("Connected to {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => match stream.shutdown(std::net::Shutdown::Both) {
                // The peer may already have hung up
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let stream = self.stream()?;
        let mut probe = [0u8; PEEK_SIZE];
        match stream.peek(&mut probe) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let stream = self.stream()?;
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"))
                }
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        stream.set_nonblocking(false)?;
        let result = stream.write_all(data).and_then(|_| stream.flush());
        stream.set_nonblocking(true)?;
        result.map(|_| data.len())
    }
}

/// Resolves `host:port` names
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpPortService;

impl PortService for TcpPortService {
    fn find_port(&self, name: &str, settings: &PortSettings) -> Option<Box<dyn Transport>> {
        let addr = match name.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!("Could not resolve {}: {}", name, e);
                None
            }
        }?;
        debug!("Resolved {} to {}", name, addr);
        Some(Box::new(TcpTransport::new(name, addr, settings.connect_timeout)))
    }
}

//! In-memory transport
//!
//! A pipe between the emulator ([`MemoryTransport`]) and a simulated device
//! ([`MemoryPeer`]). The peer can queue bytes, inspect what the emulator
//! wrote back, hang up, and register automatic replies to specific bytes.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{not_open, PortService, PortSettings, Transport};

#[derive(Debug, Default)]
struct Pipe {
    /// Device to emulator
    inbound: VecDeque<u8>,
    /// Emulator to device
    outbound: Vec<u8>,
    open: bool,
    hung_up: bool,
    refuse_open: bool,
    /// Writes succeed but accept nothing
    stall_writes: bool,
    open_count: usize,
    close_count: usize,
    /// Bytes queued inbound whenever the emulator writes the key byte
    replies: HashMap<u8, Vec<u8>>,
}

type SharedPipe = Arc<Mutex<Pipe>>;

fn lock(pipe: &SharedPipe) -> MutexGuard<'_, Pipe> {
    pipe.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected transport/peer pair
pub fn pipe(name: impl Into<String>) -> (MemoryTransport, MemoryPeer) {
    let shared = SharedPipe::default();
    (
        MemoryTransport {
            name: name.into(),
            pipe: shared.clone(),
        },
        MemoryPeer { pipe: shared },
    )
}

/// Emulator side of the pipe
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    pipe: SharedPipe,
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<()> {
        let mut pipe = lock(&self.pipe);
        if pipe.refuse_open {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused to open", self.name),
            ));
        }
        pipe.open = true;
        pipe.open_count += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut pipe = lock(&self.pipe);
        pipe.open = false;
        pipe.close_count += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.pipe).open
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let pipe = lock(&self.pipe);
        if !pipe.open {
            return Err(not_open(&self.name));
        }
        if pipe.inbound.is_empty() && pipe.hung_up {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device hung up"));
        }
        Ok(pipe.inbound.len())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut pipe = lock(&self.pipe);
        if !pipe.open {
            return Err(not_open(&self.name));
        }
        pipe.inbound
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no data available"))
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut pipe = lock(&self.pipe);
        if !pipe.open {
            return Err(not_open(&self.name));
        }
        if pipe.hung_up {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device hung up"));
        }
        if pipe.stall_writes {
            return Ok(0);
        }
        pipe.outbound.extend_from_slice(data);
        for b in data {
            if let Some(reply) = pipe.replies.get(b).cloned() {
                pipe.inbound.extend(reply);
            }
        }
        Ok(data.len())
    }
}

/// Device side of the pipe
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    pipe: SharedPipe,
}

impl MemoryPeer {
    /// Queue bytes for the emulator to read
    pub fn send(&self, data: &[u8]) {
        lock(&self.pipe).inbound.extend(data.iter().copied());
    }

    /// Queue `reply` every time the emulator writes `trigger`
    pub fn reply_on(&self, trigger: u8, reply: &[u8]) {
        lock(&self.pipe).replies.insert(trigger, reply.to_vec());
    }

    /// Everything the emulator has written so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.pipe).outbound.clone()
    }

    /// Bytes still waiting to be read by the emulator
    pub fn pending(&self) -> usize {
        lock(&self.pipe).inbound.len()
    }

    /// Close the device end. The emulator sees EOF once the queue drains.
    pub fn hang_up(&self) {
        lock(&self.pipe).hung_up = true;
    }

    /// Make the next `open` calls fail
    pub fn refuse_open(&self, refuse: bool) {
        lock(&self.pipe).refuse_open = refuse;
    }

    /// Make writes report zero bytes accepted
    pub fn stall_writes(&self, stall: bool) {
        lock(&self.pipe).stall_writes = stall;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.pipe).open
    }

    pub fn open_count(&self) -> usize {
        lock(&self.pipe).open_count
    }

    pub fn close_count(&self) -> usize {
        lock(&self.pipe).close_count
    }
}

/// Named in-memory endpoints. Each registered transport can be handed out once.
#[derive(Debug, Default)]
pub struct MemoryPortService {
    ports: Mutex<HashMap<String, MemoryTransport>>,
}

impl MemoryPortService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return its device side
    pub fn register(&self, name: &str) -> MemoryPeer {
        let (transport, peer) = pipe(name);
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), transport);
        peer
    }
}

impl PortService for MemoryPortService {
    fn find_port(&self, name: &str, settings: &PortSettings) -> Option<Box<dyn Transport>> {
        let transport = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)?;
        debug!("Handing out memory port {} ({})", name, settings);
        Some(Box::new(transport))
    }
}

//! Listener task
//!
//! Owns one connection from start to finish: open the transport, wait for
//! the device's handshake, then feed every received byte to the decoder
//! until cancelled or disconnected.
//!
//! ```text
//! Idle -> Opening -> Handshaking -> Streaming -> Closing -> Closed
//!            |            |               |
//!            v            +-> Closing     +-> Closing -> Failed (lost)
//!          Failed              (timeout: Failed, cancel: Closed)
//! ```
//!
//! Progress is reported as [`ListenerEvent`]s on a channel. The task is
//! meant to run on its own thread and never touches UI state.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::glcd::{Buffering, DisplayFlags, InstructionDecoder, Region};
use super::options::{keys, ConfigError, ListenerOptions};
use super::transport::{PortSettings, Transport};

/// Handshake request sent by the device
pub const MSG_REQ: u8 = 0x7B;
/// Handshake acknowledgement sent back by the emulator
pub const MSG_ACK: u8 = 0x7C;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Opening,
    Handshaking,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Opening => "Opening",
            ConnectionState::Handshaking => "Handshaking",
            ConnectionState::Streaming => "Streaming",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Events published by a running listener
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    StateChanged(ConnectionState),
    /// True once the handshake completes, false on any terminal transition
    Connected(bool),
    /// Human readable status line
    Message(String),
    /// Pixels changed inside the region
    BufferUpdated(Region),
    DisplayChanged(DisplayFlags),
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Listener has not been configured")]
    NotConfigured,

    #[error("Could not connect to {name}: {source}")]
    TransportOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("No handshake received within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] io::Error),

    #[error("Failed to write to transport: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to spawn listener thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Listener thread panicked")]
    WorkerPanicked,
}

/// Polling intervals and limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerTiming {
    /// Sleep between availability checks while handshaking
    pub poll_interval: Duration,
    /// Give up the handshake after this long, `None` waits until cancelled
    pub handshake_timeout: Option<Duration>,
    /// Sleep between availability checks while streaming with no data
    pub idle_interval: Duration,
}

impl Default for ListenerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            handshake_timeout: None,
            idle_interval: Duration::from_millis(1),
        }
    }
}

pub struct ListenerTask {
    decoder: InstructionDecoder,
    transport: Option<Box<dyn Transport>>,
    settings: Option<PortSettings>,
    timing: ListenerTiming,
    state: ConnectionState,
    connected: bool,
    cancelled: Arc<AtomicBool>,
    events: Sender<ListenerEvent>,
    last_flags: DisplayFlags,
}

impl ListenerTask {
    pub fn new(decoder: InstructionDecoder, timing: ListenerTiming, events: Sender<ListenerEvent>) -> Self {
        let last_flags = decoder.flags();
        Self {
            decoder,
            transport: None,
            settings: None,
            timing,
            state: ConnectionState::Idle,
            connected: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            events,
            last_flags,
        }
    }

    /// Flag that stops the task when set
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn decoder(&self) -> &InstructionDecoder {
        &self.decoder
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Validate options and resolve the endpoint. Nothing is opened yet.
    pub fn configure(&mut self, options: &ListenerOptions) -> Result<(), ConfigError> {
        debug!("Processing listener options: {}", options);

        let service = options.require(keys::PORT_SERVICE)?;
        let port_name = options.require(keys::PORT_NAME)?;
        if port_name.trim().is_empty() {
            return Err(ConfigError::InvalidOption {
                option: keys::PORT_NAME.name(),
                reason: "port name is empty".to_string(),
            });
        }
        let settings = options.port_settings()?;

        let transport = match service.find_port(&port_name, &settings) {
            Some(transport) => transport,
            None => {
                warn!("No port found named '{}'", port_name);
                return Err(ConfigError::PortNotFound(port_name));
            }
        };

        debug!("Port settings: {}", settings);
        self.transport = Some(transport);
        self.settings = Some(settings);
        Ok(())
    }

    /// Run the connection to completion. Cleanup always happens before this
    /// returns. Cancellation is a clean exit.
    pub fn run(mut self) -> Result<(), ListenerError> {
        let Some(mut transport) = self.transport.take() else {
            self.set_state(ConnectionState::Failed);
            return Err(ListenerError::NotConfigured);
        };

        let result = self.process(transport.as_mut());
        self.publish_updates();

        if !matches!(result, Err(ListenerError::TransportOpen { .. })) {
            self.set_state(ConnectionState::Closing);
        }
        self.cleanup(transport.as_mut());
        self.set_connected(false);

        match &result {
            Ok(()) => {
                self.message("Disconnected: cancelled".to_string());
                self.set_state(ConnectionState::Closed);
            }
            Err(e) => {
                error!("Listener stopped: {}", e);
                self.message(format!("Disconnected: {}", e));
                self.set_state(ConnectionState::Failed);
            }
        }

        let stats = self.decoder.stats();
        info!(
            "Decoder stats: {} commands, {} data, {} unknown, {} desync, {} framing errors",
            stats.commands, stats.data, stats.unknown, stats.desync, stats.framing_errors
        );
        result
    }

    fn process(&mut self, transport: &mut dyn Transport) -> Result<(), ListenerError> {
        info!("Starting listen task on {}", transport.name());
        self.set_state(ConnectionState::Opening);
        self.message(format!("Opening {}...", transport.name()));

        if !transport.is_open() {
            transport.open().map_err(|source| ListenerError::TransportOpen {
                name: transport.name().to_string(),
                source,
            })?;
        }
        let opened = match &self.settings {
            Some(settings) => format!("Opened {} ({})", transport.name(), settings),
            None => format!("Opened {}", transport.name()),
        };
        self.message(opened);

        self.set_state(ConnectionState::Handshaking);
        self.message("Waiting for handshake...".to_string());
        if !self.handshake(transport)? {
            return Ok(());
        }

        self.set_connected(true);
        self.set_state(ConnectionState::Streaming);
        self.message("Connected".to_string());

        self.stream(transport)
    }

    /// Wait for the device's request, acknowledge it and consume the
    /// device's response. Returns false if cancelled first.
    fn handshake(&mut self, transport: &mut dyn Transport) -> Result<bool, ListenerError> {
        let started = Instant::now();
        let mut acknowledged = false;

        loop {
            if self.is_cancelled() {
                debug!("Handshake cancelled");
                return Ok(false);
            }
            if let Some(limit) = self.timing.handshake_timeout {
                if started.elapsed() >= limit {
                    return Err(ListenerError::HandshakeTimeout(limit));
                }
            }

            let available = transport.bytes_available().map_err(ListenerError::ConnectionLost)?;
            if available == 0 {
                thread::sleep(self.timing.poll_interval);
                continue;
            }

            let data = transport.read_byte().map_err(ListenerError::ConnectionLost)?;
            if !acknowledged {
                if data == MSG_REQ {
                    info!("Received request from client. Sending ACK");
                    let written = transport.write_bytes(&[MSG_ACK]).map_err(ListenerError::Write)?;
                    if written != 1 {
                        return Err(ListenerError::Write(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "acknowledge byte was not accepted",
                        )));
                    }
                    acknowledged = true;
                } else {
                    debug!("Not acknowledged, discarding 0x{:02X}", data);
                }
                continue;
            }

            debug!("Response received, acknowledged (data: 0x{:02X})", data);
            self.decoder.reset();
            return Ok(true);
        }
    }

    fn stream(&mut self, transport: &mut dyn Transport) -> Result<(), ListenerError> {
        while !self.is_cancelled() {
            let available = transport.bytes_available().map_err(ListenerError::ConnectionLost)?;
            if available == 0 {
                thread::sleep(self.timing.idle_interval);
                continue;
            }

            for _ in 0..available {
                if self.is_cancelled() {
                    break;
                }
                let data = transport.read_byte().map_err(ListenerError::ConnectionLost)?;
                self.decoder.feed(data);
            }
            self.publish_updates();
        }
        debug!("Streaming cancelled");
        Ok(())
    }

    /// Best effort, errors are only logged
    fn cleanup(&mut self, transport: &mut dyn Transport) {
        if !transport.is_open() {
            return;
        }
        match transport.close() {
            Ok(()) => info!("{} successfully closed", transport.name()),
            Err(e) => warn!("Failed to close {}: {}", transport.name(), e),
        }
    }

    fn publish_updates(&mut self) {
        if let Some(region) = self.decoder.strategy().buffer().take_dirty() {
            self.emit(ListenerEvent::BufferUpdated(region));
        }
        let flags = self.decoder.flags();
        if flags != self.last_flags {
            self.last_flags = flags;
            self.emit(ListenerEvent::DisplayChanged(flags));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("State {} -> {}", self.state, state);
        self.state = state;
        self.emit(ListenerEvent::StateChanged(state));
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        self.emit(ListenerEvent::Connected(connected));
    }

    fn message(&self, text: String) {
        info!("{}", text);
        self.emit(ListenerEvent::Message(text));
    }

    fn emit(&self, event: ListenerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::glcd::{
        encode_frame, BitOrder, BufferStrategy, InstructionFlag, PixelBuffer, SharedBuffer, StrategyKind,
    };
    use crate::core::transport::{MemoryPeer, MemoryPortService, PortService};
    use std::sync::mpsc::{self, Receiver};
    use std::thread::JoinHandle;

    fn fast_timing() -> ListenerTiming {
        ListenerTiming {
            poll_interval: Duration::from_millis(2),
            handshake_timeout: None,
            idle_interval: Duration::from_millis(1),
        }
    }

    fn options_for(service: Arc<dyn PortService>, name: &str) -> ListenerOptions {
        ListenerOptions::builder()
            .put(keys::PORT_SERVICE, service)
            .put(keys::PORT_NAME, name.to_string())
            .build()
    }

    fn task(timing: ListenerTiming) -> (ListenerTask, Receiver<ListenerEvent>, SharedBuffer, MemoryPeer) {
        let service = Arc::new(MemoryPortService::new());
        let peer = service.register("lcd");
        let buffer = SharedBuffer::new(PixelBuffer::new(128, 64));
        let strategy = BufferStrategy::new(StrategyKind::Paged, buffer.clone(), BitOrder::MsbFirst);
        let (tx, rx) = mpsc::channel();
        let mut task = ListenerTask::new(InstructionDecoder::new(strategy), timing, tx);
        task.configure(&options_for(service, "lcd")).unwrap();
        (task, rx, buffer, peer)
    }

    fn spawn(task: ListenerTask) -> (Arc<AtomicBool>, JoinHandle<Result<(), ListenerError>>) {
        let cancel = task.cancel_flag();
        (cancel, thread::spawn(move || task.run()))
    }

    /// Collect events until one matches
    fn wait_for(rx: &Receiver<ListenerEvent>, expected: &ListenerEvent) -> Vec<ListenerEvent> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
                let done = &event == expected;
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }
        panic!("never saw {:?}, got {:?}", expected, seen);
    }

    fn states(events: &[ListenerEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_then_stream() {
        let (task, rx, buffer, peer) = task(fast_timing());
        peer.reply_on(MSG_ACK, &[0x01]);
        // Noise before the request is discarded
        peer.send(&[0x00, 0x55, MSG_REQ]);

        let (cancel, handle) = spawn(task);
        let events = wait_for(&rx, &ListenerEvent::StateChanged(ConnectionState::Streaming));
        assert!(events.contains(&ListenerEvent::Connected(true)));
        assert!(events.contains(&ListenerEvent::Message(
            "Opened lcd (Baudrate=9600, DataBits=8, StopBits=One, Parity=None, Flow Control=None)".to_string()
        )));
        assert_eq!(peer.written(), vec![MSG_ACK]);

        peer.send(&encode_frame(InstructionFlag::Data, &[0xFF]));
        let events = wait_for(&rx, &ListenerEvent::BufferUpdated(Region { x0: 0, y0: 0, x1: 0, y1: 7 }));
        assert!(!events.iter().any(|e| matches!(e, ListenerEvent::Connected(false))));
        assert_eq!(buffer.read().count_lit(), 8);

        cancel.store(true, Ordering::SeqCst);
        assert!(handle.join().unwrap().is_ok());

        let rest: Vec<ListenerEvent> = rx.try_iter().collect();
        assert!(rest.contains(&ListenerEvent::Connected(false)));
        assert_eq!(
            states(&rest),
            vec![ConnectionState::Closing, ConnectionState::Closed]
        );
        assert!(rest.contains(&ListenerEvent::Message("Disconnected: cancelled".to_string())));
        assert!(!peer.is_open());
        // ACK went out exactly once
        assert_eq!(peer.written(), vec![MSG_ACK]);
    }

    #[test]
    fn test_handshake_response_is_not_decoded() {
        let (task, rx, buffer, peer) = task(fast_timing());
        // The response byte would be a sync byte if it were decoded
        peer.reply_on(MSG_ACK, &[0xFA]);
        peer.send(&[MSG_REQ]);

        let (cancel, handle) = spawn(task);
        wait_for(&rx, &ListenerEvent::StateChanged(ConnectionState::Streaming));

        // Without a sync byte of its own this payload must be dropped
        peer.send(&[0xF0, 0xF0]);
        thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();

        assert_eq!(buffer.read().count_lit(), 0);
    }

    #[test]
    fn test_cancel_while_waiting_for_handshake() {
        let (task, rx, _, peer) = task(fast_timing());
        let (cancel, handle) = spawn(task);
        wait_for(&rx, &ListenerEvent::StateChanged(ConnectionState::Handshaking));

        let started = Instant::now();
        cancel.store(true, Ordering::SeqCst);
        assert!(handle.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));

        let rest: Vec<ListenerEvent> = rx.try_iter().collect();
        assert_eq!(states(&rest), vec![ConnectionState::Closing, ConnectionState::Closed]);
        assert!(!rest.contains(&ListenerEvent::Connected(true)));
        assert!(!peer.is_open());
        assert_eq!(peer.close_count(), 1);
        assert!(peer.written().is_empty());
    }

    #[test]
    fn test_handshake_timeout() {
        let timing = ListenerTiming {
            handshake_timeout: Some(Duration::from_millis(30)),
            ..fast_timing()
        };
        let (task, rx, _, peer) = task(timing);
        peer.send(&[0x01, 0x02]);

        let result = task.run();
        assert!(matches!(result, Err(ListenerError::HandshakeTimeout(_))));

        let events: Vec<ListenerEvent> = rx.try_iter().collect();
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Opening,
                ConnectionState::Handshaking,
                ConnectionState::Closing,
                ConnectionState::Failed,
            ]
        );
        assert!(!events.iter().any(|e| matches!(e, ListenerEvent::Connected(_))));
        assert!(!peer.is_open());
    }

    #[test]
    fn test_unaccepted_ack_fails_handshake() {
        let (task, rx, _, peer) = task(fast_timing());
        peer.stall_writes(true);
        peer.send(&[MSG_REQ, 0x00]);

        let result = task.run();
        match result {
            Err(ListenerError::Write(e)) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("expected write error, got {:?}", other),
        }

        let events: Vec<ListenerEvent> = rx.try_iter().collect();
        assert_eq!(states(&events).last(), Some(&ConnectionState::Failed));
        assert!(!events.contains(&ListenerEvent::Connected(true)));
        assert!(!peer.is_open());
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let (task, rx, _, peer) = task(fast_timing());
        peer.refuse_open(true);

        let result = task.run();
        assert!(matches!(result, Err(ListenerError::TransportOpen { .. })));

        let events: Vec<ListenerEvent> = rx.try_iter().collect();
        assert_eq!(states(&events), vec![ConnectionState::Opening, ConnectionState::Failed]);
        assert_eq!(peer.open_count(), 0);
    }

    #[test]
    fn test_unexpected_disconnect() {
        let (task, rx, _, peer) = task(fast_timing());
        peer.reply_on(MSG_ACK, &[0x00]);
        peer.send(&[MSG_REQ]);

        let (_cancel, handle) = spawn(task);
        wait_for(&rx, &ListenerEvent::StateChanged(ConnectionState::Streaming));
        peer.hang_up();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ListenerError::ConnectionLost(_))));

        let rest: Vec<ListenerEvent> = rx.try_iter().collect();
        assert!(rest.contains(&ListenerEvent::Connected(false)));
        assert_eq!(states(&rest), vec![ConnectionState::Closing, ConnectionState::Failed]);
        assert!(rest.iter().any(|e| matches!(
            e,
            ListenerEvent::Message(m) if m.starts_with("Disconnected: Connection lost")
        )));
        assert!(!peer.is_open());
    }

    #[test]
    fn test_display_flags_published() {
        let (task, rx, _, peer) = task(fast_timing());
        peer.reply_on(MSG_ACK, &[0x00]);
        peer.send(&[MSG_REQ]);

        let (cancel, handle) = spawn(task);
        wait_for(&rx, &ListenerEvent::Connected(true));
        peer.send(&encode_frame(InstructionFlag::Command, &[0xAF]));
        wait_for(&rx, &ListenerEvent::DisplayChanged(DisplayFlags::DISPLAY_ON));

        cancel.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_configure_errors() {
        let buffer = SharedBuffer::new(PixelBuffer::new(8, 8));
        let new_task = || {
            let strategy = BufferStrategy::new(StrategyKind::Paged, buffer.clone(), BitOrder::MsbFirst);
            let (tx, _rx) = mpsc::channel();
            ListenerTask::new(InstructionDecoder::new(strategy), fast_timing(), tx)
        };

        let missing = ListenerOptions::builder().put(keys::PORT_NAME, "lcd".to_string()).build();
        assert_eq!(
            new_task().configure(&missing),
            Err(ConfigError::MissingOption("PORT_SERVICE"))
        );

        let service: Arc<dyn PortService> = Arc::new(MemoryPortService::new());
        assert_eq!(
            new_task().configure(&options_for(service.clone(), "nowhere")),
            Err(ConfigError::PortNotFound("nowhere".to_string()))
        );
        assert!(matches!(
            new_task().configure(&options_for(service, "  ")),
            Err(ConfigError::InvalidOption { option: "PORT_NAME", .. })
        ));
    }

    #[test]
    fn test_run_without_configure() {
        let buffer = SharedBuffer::new(PixelBuffer::new(8, 8));
        let strategy = BufferStrategy::new(StrategyKind::Simple, buffer, BitOrder::MsbFirst);
        let (tx, _rx) = mpsc::channel();
        let task = ListenerTask::new(InstructionDecoder::new(strategy), fast_timing(), tx);
        assert_eq!(task.state(), ConnectionState::Idle);
        assert!(matches!(task.run(), Err(ListenerError::NotConfigured)));
    }
}

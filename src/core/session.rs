//! Session management
//!
//! An emulator session owns the pixel buffer and at most one listener
//! worker. Starting a new connection always tears the previous worker down
//! first, so only one thread ever writes to the buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::glcd::{BitOrder, BufferStrategy, InstructionDecoder, SharedBuffer, StrategyKind};
use super::listener::{ConnectionState, ListenerError, ListenerEvent, ListenerTask, ListenerTiming};
use super::options::ListenerOptions;

/// A running listener thread
struct Worker {
    handle: JoinHandle<Result<(), ListenerError>>,
    cancel: Arc<AtomicBool>,
    events: Receiver<ListenerEvent>,
}

/// An emulator session
pub struct EmulatorSession {
    buffer: SharedBuffer,
    strategy: StrategyKind,
    bit_order: BitOrder,
    timing: ListenerTiming,
    worker: Option<Worker>,
    state: ConnectionState,
    connected: bool,
}

impl EmulatorSession {
    pub fn new(buffer: SharedBuffer, strategy: StrategyKind, bit_order: BitOrder, timing: ListenerTiming) -> Self {
        Self {
            buffer,
            strategy,
            bit_order,
            timing,
            worker: None,
            state: ConnectionState::Idle,
            connected: false,
        }
    }

    /// The buffer renderers should read from
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a worker thread is still running
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.handle.is_finished())
    }

    /// Start listening with the given options. Any previous worker is stopped
    /// and joined first. Configuration errors are returned before a thread
    /// is spawned.
    pub fn start(&mut self, options: &ListenerOptions) -> Result<(), ListenerError> {
        if let Some(previous) = self.stop() {
            debug!("Previous listener finished with {:?}", previous);
        }

        let (tx, rx) = mpsc::channel();
        let strategy = BufferStrategy::new(self.strategy, self.buffer.clone(), self.bit_order);
        let mut task = ListenerTask::new(InstructionDecoder::new(strategy), self.timing, tx);
        task.configure(options)?;

        let cancel = task.cancel_flag();
        let handle = thread::Builder::new()
            .name("glcd-listener".to_string())
            .spawn(move || task.run())
            .map_err(ListenerError::Spawn)?;

        info!("Listener started");
        self.state = ConnectionState::Idle;
        self.connected = false;
        self.worker = Some(Worker {
            handle,
            cancel,
            events: rx,
        });
        Ok(())
    }

    /// Cancel the worker, wait for it to finish cleanup and return its
    /// result. `None` if nothing was running.
    pub fn stop(&mut self) -> Option<Result<(), ListenerError>> {
        let worker = self.worker.take()?;
        worker.cancel.store(true, Ordering::SeqCst);

        let result = worker.handle.join().unwrap_or_else(|_| {
            warn!("Listener thread panicked");
            Err(ListenerError::WorkerPanicked)
        });

        // Pick up the final transitions so state and connected settle
        for event in worker.events.try_iter() {
            self.track(&event);
        }
        if !self.state.is_terminal() {
            self.state = ConnectionState::Closed;
        }
        self.connected = false;
        Some(result)
    }

    /// Drain pending events without blocking
    pub fn poll_events(&mut self) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        let Some(worker) = &self.worker else {
            return events;
        };

        loop {
            match worker.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        for event in &events {
            self.track(event);
        }
        events
    }

    /// Wait up to `timeout` for the next event. `None` on timeout or once
    /// the worker has exited and every event was delivered.
    pub fn next_event(&mut self, timeout: Duration) -> Option<ListenerEvent> {
        let worker = self.worker.as_ref()?;
        let event = match worker.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };
        self.track(&event);
        Some(event)
    }

    fn track(&mut self, event: &ListenerEvent) {
        match event {
            ListenerEvent::StateChanged(state) => self.state = *state,
            ListenerEvent::Connected(connected) => self.connected = *connected,
            _ => {}
        }
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

//! Core emulator components.
//!
//! This module contains everything between the transport and the pixels:
//!
//! - **glcd**: pixel buffer, buffer strategies and the instruction decoder
//! - **transport**: byte-stream handles and the port services resolving them
//! - **options**: typed listener configuration
//! - **listener**: connection state machine (open, handshake, stream)
//! - **session**: owns the listener worker thread and its events
//!
//! # Architecture
//!
//! ```text
//! EmulatorSession
//! └── ListenerTask (worker thread)
//!     ├── Transport (tcp / memory / external serial)
//!     └── InstructionDecoder
//!         └── BufferStrategy -> SharedBuffer <- renderer
//! ```

pub mod glcd;
pub mod listener;
pub mod options;
pub mod session;
pub mod transport;

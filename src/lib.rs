//! glcd-emu library
//!
//! Emulates the display controller of a monochrome graphical LCD. A
//! [`core::session::EmulatorSession`] runs a listener thread that performs
//! the device handshake, decodes the framed command/data stream and writes
//! pixels into a shared buffer that any renderer can read.

pub mod config;
pub mod core;

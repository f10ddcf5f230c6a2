//! Instruction decoder
//!
//! Turns the framed transport byte stream into instructions and dispatches
//! them: command bytes update addressing and display state, data bytes go
//! to the active buffer strategy. Nothing in here is fatal. Unknown
//! commands, broken framing and out-of-range writes are logged and the
//! offending byte is dropped so the stream stays aligned.

use tracing::{debug, trace, warn};

use super::instruction::{Command, DisplayFlags, FrameByte, Instruction, InstructionFlag};
use super::pixel::BufferError;
use super::strategy::{AddressingMode, BufferStrategy, Buffering};

/// Default contrast after reset
pub const DEFAULT_CONTRAST: u8 = 0x7F;

/// Counters kept for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub commands: u64,
    pub data: u64,
    pub unknown: u64,
    pub desync: u64,
    pub framing_errors: u64,
}

/// Command waiting for its parameter byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parameter {
    AddressingMode,
    Contrast,
}

pub struct InstructionDecoder {
    strategy: BufferStrategy,
    /// Register selected by the last sync byte
    register: Option<InstructionFlag>,
    high_nibble: Option<u8>,
    pending: Option<Parameter>,
    /// Column address assembled from nibble commands but not yet in range
    column_latch: Option<usize>,
    flags: DisplayFlags,
    contrast: u8,
    start_line: u8,
    stats: DecoderStats,
}

impl InstructionDecoder {
    pub fn new(strategy: BufferStrategy) -> Self {
        Self {
            strategy,
            register: None,
            high_nibble: None,
            pending: None,
            column_latch: None,
            flags: DisplayFlags::default(),
            contrast: DEFAULT_CONTRAST,
            start_line: 0,
            stats: DecoderStats::default(),
        }
    }

    pub fn strategy(&self) -> &BufferStrategy {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut BufferStrategy {
        &mut self.strategy
    }

    pub fn flags(&self) -> DisplayFlags {
        self.flags
    }

    pub fn contrast(&self) -> u8 {
        self.contrast
    }

    pub fn start_line(&self) -> u8 {
        self.start_line
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop any partial framing state and return the cursor to the origin.
    /// Pixels and display flags are kept.
    pub fn reset(&mut self) {
        self.register = None;
        self.high_nibble = None;
        self.pending = None;
        self.column_latch = None;
        self.strategy.reset();
    }

    /// Feed a single raw transport byte
    pub fn feed(&mut self, byte: u8) {
        match FrameByte::classify(byte) {
            FrameByte::Sync { read: true, .. } => {
                // Nothing is driven back to the host, so reads are not supported
                debug!("Ignoring read request 0x{:02X}", byte);
                self.register = None;
                self.high_nibble = None;
            }
            FrameByte::Sync { flag, .. } => {
                if self.high_nibble.take().is_some() {
                    self.framing_error(byte, "sync byte inside a payload byte");
                }
                self.register = Some(flag);
            }
            FrameByte::Nibble(nibble) => {
                let Some(flag) = self.register else {
                    trace!("Dropping 0x{:02X}, no register selected", byte);
                    return;
                };
                match self.high_nibble.take() {
                    None => self.high_nibble = Some(nibble),
                    Some(high) => {
                        let value = (high << 4) | nibble;
                        self.feed_instruction(Instruction::new(flag, value));
                    }
                }
            }
            FrameByte::Invalid => {
                self.high_nibble = None;
                self.framing_error(byte, "not a sync or nibble byte");
            }
        }
    }

    pub fn feed_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.feed(b);
        }
    }

    /// Dispatch one decoded instruction
    pub fn feed_instruction(&mut self, instruction: Instruction) {
        trace!("{}", instruction);
        match instruction.flag() {
            InstructionFlag::Command => {
                self.stats.commands += 1;
                self.execute_command(instruction.value());
            }
            InstructionFlag::Data => {
                self.stats.data += 1;
                if let Some(parameter) = self.pending.take() {
                    debug!("Data byte arrived while {:?} awaited its parameter", parameter);
                }
                // A column address still out of range when data arrives is a desync
                if let Some(column) = self.column_latch.take() {
                    if let Err(e) = self.strategy.set_column(column) {
                        self.desync(instruction, e);
                        return;
                    }
                }
                if let Err(e) = self.strategy.process_byte(instruction.value()) {
                    self.desync(instruction, e);
                }
            }
        }
    }

    fn execute_command(&mut self, byte: u8) {
        if let Some(parameter) = self.pending.take() {
            self.apply_parameter(parameter, byte);
            return;
        }

        let Some(command) = Command::decode(byte) else {
            self.stats.unknown += 1;
            debug!("Ignoring unknown command 0x{:02X}", byte);
            return;
        };

        let result = match command {
            Command::ColumnLow(nibble) => {
                let column = (self.column_address() & !0x0F) | nibble as usize;
                self.latch_column(column);
                Ok(())
            }
            Command::ColumnHigh(nibble) => {
                let column = (self.column_address() & 0x0F) | ((nibble as usize) << 4);
                self.latch_column(column);
                Ok(())
            }
            Command::Page(page) => self.strategy.set_page(page as usize),
            Command::AddressingMode => {
                self.pending = Some(Parameter::AddressingMode);
                Ok(())
            }
            Command::Contrast => {
                self.pending = Some(Parameter::Contrast);
                Ok(())
            }
            Command::StartLine(line) => {
                self.start_line = line;
                Ok(())
            }
            Command::EntireDisplayOn(on) => {
                self.flags.set(DisplayFlags::ALL_PIXELS_ON, on);
                Ok(())
            }
            Command::Inverse(on) => {
                self.flags.set(DisplayFlags::INVERSE, on);
                Ok(())
            }
            Command::DisplayOn(on) => {
                self.flags.set(DisplayFlags::DISPLAY_ON, on);
                Ok(())
            }
            Command::Reset => {
                debug!("Controller reset");
                self.column_latch = None;
                self.strategy.reset();
                self.contrast = DEFAULT_CONTRAST;
                self.start_line = 0;
                Ok(())
            }
            Command::Nop => Ok(()),
        };

        if let Err(e) = result {
            self.desync(Instruction::command(byte), e);
        }
    }

    /// Column address the next nibble command modifies
    fn column_address(&self) -> usize {
        self.column_latch.unwrap_or_else(|| self.strategy.cursor().column)
    }

    /// Apply a column address once it is in range. The two nibbles arrive as
    /// separate commands, so the first one alone may point past the last
    /// column; it is held until the second nibble or the next data byte.
    fn latch_column(&mut self, column: usize) {
        match self.strategy.set_column(column) {
            Ok(()) => self.column_latch = None,
            Err(_) => {
                trace!("Holding column address {} until it is complete", column);
                self.column_latch = Some(column);
            }
        }
    }

    fn apply_parameter(&mut self, parameter: Parameter, value: u8) {
        match parameter {
            Parameter::Contrast => self.contrast = value,
            Parameter::AddressingMode => {
                let mode = match value & 0x03 {
                    0 => AddressingMode::Horizontal,
                    2 => AddressingMode::Page,
                    _ => {
                        warn!("Unsupported addressing mode 0x{:02X}, keeping current mode", value);
                        return;
                    }
                };
                if !self.strategy.set_addressing_mode(mode) {
                    debug!("{:?} strategy has no addressing modes", self.strategy.kind());
                }
            }
        }
    }

    fn desync(&mut self, instruction: Instruction, error: BufferError) {
        self.stats.desync += 1;
        warn!("Stream desync, dropped {}: {}", instruction, error);
    }

    fn framing_error(&mut self, byte: u8, reason: &str) {
        self.stats.framing_errors += 1;
        warn!("Framing error at 0x{:02X}: {}", byte, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::glcd::instruction::encode_frame;
    use crate::core::glcd::pixel::{PixelBuffer, SharedBuffer, PIXEL_OFF, PIXEL_ON};
    use crate::core::glcd::strategy::{BitOrder, Cursor, StrategyKind};

    fn decoder(kind: StrategyKind, width: usize, height: usize) -> (InstructionDecoder, SharedBuffer) {
        let buffer = SharedBuffer::new(PixelBuffer::new(width, height));
        let strategy = BufferStrategy::new(kind, buffer.clone(), BitOrder::MsbFirst);
        (InstructionDecoder::new(strategy), buffer)
    }

    fn commands(decoder: &mut InstructionDecoder, bytes: &[u8]) {
        decoder.feed_all(&encode_frame(InstructionFlag::Command, bytes));
    }

    fn data(decoder: &mut InstructionDecoder, bytes: &[u8]) {
        decoder.feed_all(&encode_frame(InstructionFlag::Data, bytes));
    }

    #[test]
    fn test_data_bytes_reach_strategy() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 16, 16);
        data(&mut decoder, &[0xFF, 0x80]);

        let pixels = buffer.read();
        assert_eq!(pixels.count_lit(), 9);
        assert_eq!(pixels.get(1, 0), Ok(PIXEL_ON));
        assert_eq!(decoder.stats().data, 2);
    }

    #[test]
    fn test_page_and_column_commands() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 128, 64);
        // Page 3, column 0x25
        commands(&mut decoder, &[0xB3, 0x05, 0x12]);
        assert_eq!(decoder.strategy().cursor(), Cursor { page: 3, column: 0x25, row: 0 });

        data(&mut decoder, &[0x80]);
        assert_eq!(buffer.read().get(0x25, 24), Ok(PIXEL_ON));
    }

    #[test]
    fn test_column_high_nibble_first_crosses_boundary() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 84, 48);
        commands(&mut decoder, &[0x14, 0x0F]);
        assert_eq!(decoder.strategy().cursor().column, 0x4F);

        // 0x5F is past the last column until the low nibble lands
        commands(&mut decoder, &[0x15, 0x00]);
        assert_eq!(decoder.strategy().cursor().column, 80);
        assert_eq!(decoder.stats().desync, 0);

        data(&mut decoder, &[0x80]);
        assert_eq!(buffer.read().get(80, 0), Ok(PIXEL_ON));
    }

    #[test]
    fn test_incomplete_column_address_out_of_range() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 84, 48);
        commands(&mut decoder, &[0x02, 0x12]);
        // High nibble 6 puts the column at 0x62, past the last column
        commands(&mut decoder, &[0x16]);
        assert_eq!(decoder.stats().desync, 0);
        assert_eq!(decoder.strategy().cursor().column, 0x12);

        data(&mut decoder, &[0xFF]);
        assert_eq!(decoder.stats().desync, 1);
        assert_eq!(buffer.read().count_lit(), 0);

        // The held address was dropped, data continues at the old cursor
        data(&mut decoder, &[0xFF]);
        assert_eq!(buffer.read().get(0x12, 7), Ok(PIXEL_ON));
    }

    #[test]
    fn test_unknown_command_ignored() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 128, 64);
        commands(&mut decoder, &[0xD5, 0x30]);

        assert_eq!(buffer.read().count_lit(), 0);
        assert!(!buffer.read().is_dirty());
        assert_eq!(decoder.strategy().cursor(), Cursor::default());
        assert_eq!(decoder.stats().unknown, 2);

        // Stream stays aligned
        data(&mut decoder, &[0xFF]);
        assert_eq!(buffer.read().count_lit(), 8);
    }

    #[test]
    fn test_out_of_range_page_is_desync() {
        let (mut decoder, _) = decoder(StrategyKind::Paged, 128, 64);
        commands(&mut decoder, &[0xB2, 0xB9]);
        assert_eq!(decoder.strategy().cursor().page, 2);
        assert_eq!(decoder.stats().desync, 1);
    }

    #[test]
    fn test_display_flags_and_parameters() {
        let (mut decoder, _) = decoder(StrategyKind::Paged, 128, 64);
        commands(&mut decoder, &[0xAF, 0xA7, 0x81, 0x30, 0x45]);

        assert!(decoder.flags().contains(DisplayFlags::DISPLAY_ON | DisplayFlags::INVERSE));
        assert_eq!(decoder.contrast(), 0x30);
        assert_eq!(decoder.start_line(), 0x05);
        assert_eq!(decoder.stats().unknown, 0);

        commands(&mut decoder, &[0xAE, 0xA6]);
        assert!(decoder.flags().is_empty());
    }

    #[test]
    fn test_framing_error_resyncs() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 8, 8);
        // Half a payload byte, then garbage, then a full byte
        decoder.feed_all(&[0xFA, 0xF0, 0x7B, 0x80, 0x00]);

        assert_eq!(decoder.stats().framing_errors, 1);
        assert_eq!(decoder.stats().data, 1);
        assert_eq!(buffer.read().count_lit(), 1);
    }

    #[test]
    fn test_payload_before_sync_dropped() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 8, 8);
        decoder.feed_all(&[0xF0, 0xF0]);
        assert_eq!(decoder.stats().data, 0);
        assert_eq!(buffer.read().count_lit(), 0);
    }

    #[test]
    fn test_reset_command_returns_to_origin() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 32, 32);
        commands(&mut decoder, &[0xB1, 0x81, 0x10]);
        data(&mut decoder, &[0xFF, 0xFF]);
        commands(&mut decoder, &[0xE2]);

        assert_eq!(decoder.strategy().cursor(), Cursor::default());
        assert_eq!(decoder.contrast(), DEFAULT_CONTRAST);
        assert_eq!(buffer.read().count_lit(), 16);
    }

    #[test]
    fn test_paged_end_to_end_page_mode() {
        let (mut decoder, buffer) = decoder(StrategyKind::Paged, 128, 64);
        // Page addressing mode: the column never rolls over into the next page
        commands(&mut decoder, &[0x20, 0x02]);

        let columns: Vec<u8> = (0..128).map(|i| if i % 2 == 0 { 0xFF } else { 0x00 }).collect();
        data(&mut decoder, &columns);

        {
            let pixels = buffer.read();
            for x in 0..128 {
                let expected = if x % 2 == 0 { PIXEL_ON } else { PIXEL_OFF };
                for y in 0..8 {
                    assert_eq!(pixels.get(x, y), Ok(expected), "pixel ({}, {})", x, y);
                }
            }
            assert_eq!(pixels.count_lit(), 64 * 8);
        }

        // 129th byte before any page command
        data(&mut decoder, &[0xFF]);
        assert_eq!(decoder.stats().desync, 1);
        assert_eq!(buffer.read().count_lit(), 64 * 8);
        assert_eq!(buffer.read().get(0, 8), Ok(PIXEL_OFF));

        // Re-addressing recovers
        commands(&mut decoder, &[0xB1, 0x00, 0x10]);
        data(&mut decoder, &[0xFF]);
        assert_eq!(buffer.read().get(0, 8), Ok(PIXEL_ON));
    }

    #[test]
    fn test_simple_strategy_ignores_addressing_mode() {
        let (mut decoder, buffer) = decoder(StrategyKind::Simple, 16, 2);
        commands(&mut decoder, &[0x20, 0x02]);
        data(&mut decoder, &[0xFF, 0x00, 0x00, 0x01]);

        assert_eq!(buffer.read().count_lit(), 9);
        assert_eq!(buffer.read().get(15, 1), Ok(PIXEL_ON));
    }
}

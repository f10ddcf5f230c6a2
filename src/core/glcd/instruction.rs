//! Controller instructions
//!
//! Bytes reach the emulator in the serial framing used by ST7920-class
//! controllers: a sync byte `0b11111_RW_RS_0` selects the register the
//! following payload goes to, and every payload byte is split into two
//! nibble bytes (high nibble first), each carried in the upper four bits.
//!
//! ```text
//! 0xF8  0xB0 0x20   command 0xB2 (set page 2)
//! 0xFA  0xF0 0xF0   data 0xFF
//!       0x00 0x00   data 0x00 (the register stays selected)
//! ```
//!
//! Command payloads follow the ST7565/SSD1306 page-addressing command set,
//! not the ST7920 instruction set. No real controller accepts this
//! combination: an unmodified ST7920 host driver will not drive the
//! emulator, and a SSD1306 driver needs its bytes wrapped in this framing.

use std::fmt;

use bitflags::bitflags;

/// Sync byte selecting the command register
pub const SYNC_COMMAND: u8 = 0xF8;
/// Sync byte selecting the data register
pub const SYNC_DATA: u8 = 0xFA;

const SYNC_MASK: u8 = 0xF8;
const SYNC_RW: u8 = 0x04;
const SYNC_RS: u8 = 0x02;

/// Which register an instruction targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionFlag {
    Command,
    Data,
}

impl InstructionFlag {
    pub fn code(self) -> u8 {
        match self {
            InstructionFlag::Command => SYNC_COMMAND,
            InstructionFlag::Data => SYNC_DATA,
        }
    }
}

/// A decoded payload byte together with its register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    flag: InstructionFlag,
    value: u8,
}

impl Instruction {
    pub const fn new(flag: InstructionFlag, value: u8) -> Self {
        Self { flag, value }
    }

    pub const fn command(value: u8) -> Self {
        Self::new(InstructionFlag::Command, value)
    }

    pub const fn data(value: u8) -> Self {
        Self::new(InstructionFlag::Data, value)
    }

    pub fn flag(&self) -> InstructionFlag {
        self.flag
    }

    pub fn value(&self) -> u8 {
        self.value
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction{{value=0x{:02X}, flag=0x{:02X}}}", self.value, self.flag.code())
    }
}

/// Classification of a raw transport byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameByte {
    /// Register select
    Sync { flag: InstructionFlag, read: bool },
    /// One nibble of a payload byte, already shifted down
    Nibble(u8),
    /// Neither a sync byte nor a nibble
    Invalid,
}

impl FrameByte {
    pub fn classify(byte: u8) -> Self {
        if byte & SYNC_MASK == SYNC_MASK && byte & 0x01 == 0 {
            let flag = if byte & SYNC_RS != 0 {
                InstructionFlag::Data
            } else {
                InstructionFlag::Command
            };
            return FrameByte::Sync { flag, read: byte & SYNC_RW != 0 };
        }

        if byte & 0x0F == 0 {
            FrameByte::Nibble(byte >> 4)
        } else {
            FrameByte::Invalid
        }
    }
}

/// Encode payload bytes for one register in the serial framing
pub fn encode_frame(flag: InstructionFlag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len() * 2);
    out.push(flag.code());
    for &b in payload {
        out.push(b & 0xF0);
        out.push(b << 4);
    }
    out
}

bitflags! {
    /// Display state toggled by commands, kept for renderers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DisplayFlags: u8 {
        const DISPLAY_ON = 0b0000_0001;
        const INVERSE = 0b0000_0010;
        const ALL_PIXELS_ON = 0b0000_0100;
    }
}

impl Default for DisplayFlags {
    fn default() -> Self {
        DisplayFlags::empty()
    }
}

/// Commands understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Lower four bits of the column address
    ColumnLow(u8),
    /// Upper four bits of the column address
    ColumnHigh(u8),
    /// Addressing mode, parameter follows
    AddressingMode,
    /// Display start line (no effect on pixels)
    StartLine(u8),
    /// Contrast, parameter follows
    Contrast,
    EntireDisplayOn(bool),
    Inverse(bool),
    DisplayOn(bool),
    Page(u8),
    Reset,
    Nop,
}

impl Command {
    /// Look up a command byte, `None` if it is not in the table
    pub fn decode(byte: u8) -> Option<Command> {
        let command = match byte {
            0x00..=0x0F => Command::ColumnLow(byte & 0x0F),
            0x10..=0x1F => Command::ColumnHigh(byte & 0x0F),
            0x20 => Command::AddressingMode,
            0x40..=0x7F => Command::StartLine(byte & 0x3F),
            0x81 => Command::Contrast,
            0xA4 | 0xA5 => Command::EntireDisplayOn(byte & 0x01 != 0),
            0xA6 | 0xA7 => Command::Inverse(byte & 0x01 != 0),
            0xAE | 0xAF => Command::DisplayOn(byte & 0x01 != 0),
            0xB0..=0xBF => Command::Page(byte & 0x0F),
            0xE2 => Command::Reset,
            0xE3 => Command::Nop,
            _ => return None,
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sync_bytes() {
        assert_eq!(
            FrameByte::classify(0xF8),
            FrameByte::Sync { flag: InstructionFlag::Command, read: false }
        );
        assert_eq!(
            FrameByte::classify(0xFA),
            FrameByte::Sync { flag: InstructionFlag::Data, read: false }
        );
        assert_eq!(
            FrameByte::classify(0xFE),
            FrameByte::Sync { flag: InstructionFlag::Data, read: true }
        );
    }

    #[test]
    fn test_classify_nibbles() {
        assert_eq!(FrameByte::classify(0xF0), FrameByte::Nibble(0xF));
        assert_eq!(FrameByte::classify(0x00), FrameByte::Nibble(0x0));
        assert_eq!(FrameByte::classify(0xA0), FrameByte::Nibble(0xA));
        assert_eq!(FrameByte::classify(0x7B), FrameByte::Invalid);
        assert_eq!(FrameByte::classify(0xF9), FrameByte::Invalid);
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(encode_frame(InstructionFlag::Command, &[0xB2]), vec![0xF8, 0xB0, 0x20]);
        assert_eq!(
            encode_frame(InstructionFlag::Data, &[0xFF, 0x00, 0x5A]),
            vec![0xFA, 0xF0, 0xF0, 0x00, 0x00, 0x50, 0xA0]
        );
    }

    #[test]
    fn test_command_table() {
        assert_eq!(Command::decode(0x0A), Some(Command::ColumnLow(0xA)));
        assert_eq!(Command::decode(0x17), Some(Command::ColumnHigh(0x7)));
        assert_eq!(Command::decode(0xB7), Some(Command::Page(7)));
        assert_eq!(Command::decode(0xAF), Some(Command::DisplayOn(true)));
        assert_eq!(Command::decode(0xA6), Some(Command::Inverse(false)));
        assert_eq!(Command::decode(0x40), Some(Command::StartLine(0)));
        assert_eq!(Command::decode(0x30), None);
        assert_eq!(Command::decode(0xD5), None);
    }

    #[test]
    fn test_instruction_display() {
        let instruction = Instruction::data(0x0F);
        assert_eq!(instruction.to_string(), "Instruction{value=0x0F, flag=0xFA}");
        assert_eq!(Instruction::command(0xE3).flag(), InstructionFlag::Command);
    }
}

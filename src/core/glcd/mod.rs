//! GLCD controller emulation.
//!
//! - **pixel**: the framebuffer and its dirty region
//! - **strategy**: maps data bytes onto pixels (simple or paged)
//! - **instruction**: serial framing and the command table
//! - **decoder**: dispatches commands and data to the strategy
//!
//! # Architecture
//!
//! ```text
//! InstructionDecoder
//! └── BufferStrategy (Simple | Paged)
//!     └── SharedBuffer
//!         └── PixelBuffer
//! ```

pub mod decoder;
pub mod instruction;
pub mod pixel;
pub mod strategy;

pub use decoder::{DecoderStats, InstructionDecoder};
pub use instruction::{encode_frame, Command, DisplayFlags, Instruction, InstructionFlag};
pub use pixel::{BoundsPolicy, BufferError, PixelBuffer, Region, SharedBuffer, PIXEL_OFF, PIXEL_ON};
pub use strategy::{AddressingMode, BitOrder, BufferStrategy, Buffering, Cursor, StrategyKind, PAGE_HEIGHT};

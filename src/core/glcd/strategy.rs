//! Buffer strategies
//!
//! A buffer strategy maps the linear stream of display data bytes onto
//! pixel coordinates and owns the controller's address cursor.
//!
//! - **Simple**: the buffer is one contiguous bitmap, 8 horizontally packed
//!   pixels per byte, rows wrap back to the origin (a full frame dump)
//! - **Paged**: the buffer is split into 8-pixel tall pages, each byte is a
//!   vertical slice of one column, overflowing the last page is a desync

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::pixel::{BufferError, SharedBuffer, PIXEL_OFF, PIXEL_ON};

/// Height of one page in pixels (one data byte)
pub const PAGE_HEIGHT: usize = 8;

/// Order in which the bits of a data byte are laid out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BitOrder {
    /// Bit 7 is the first pixel (topmost in a page, leftmost in a row)
    #[default]
    MsbFirst,
    /// Bit 0 is the first pixel
    LsbFirst,
}

impl BitOrder {
    /// Whether the `index`-th pixel (0..8) of `byte` is lit
    pub fn is_set(self, byte: u8, index: usize) -> bool {
        match self {
            BitOrder::MsbFirst => byte & (0x80 >> index) != 0,
            BitOrder::LsbFirst => byte & (0x01 << index) != 0,
        }
    }
}

/// Selects a strategy variant from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Simple,
    #[default]
    Paged,
}

/// How the paged cursor advances at the end of a page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressingMode {
    /// Column wraps to 0 and the page increments
    #[default]
    Horizontal,
    /// Column stops at the last column until re-addressed
    Page,
}

/// Current address cursor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub page: usize,
    pub column: usize,
    /// Row within the current page
    pub row: usize,
}

/// Operations shared by all strategies
pub trait Buffering {
    /// Called once after construction
    fn initialize(&mut self) {
        self.reset();
    }

    /// Move the cursor back to the origin, keeping pixel contents
    fn reset(&mut self);

    fn set_buffer(&mut self, buffer: SharedBuffer);

    fn buffer(&self) -> &SharedBuffer;

    /// Write one data byte at the cursor and advance it
    fn process_byte(&mut self, data: u8) -> Result<(), BufferError>;

    fn set_page(&mut self, page: usize) -> Result<(), BufferError>;

    fn set_column(&mut self, column: usize) -> Result<(), BufferError>;

    fn cursor(&self) -> Cursor;
}

/// Contiguous bitmap, horizontally packed
#[derive(Debug)]
pub struct SimpleBuffering {
    buffer: SharedBuffer,
    bit_order: BitOrder,
    column: usize,
    /// Absolute row
    y: usize,
}

impl SimpleBuffering {
    pub fn new(buffer: SharedBuffer, bit_order: BitOrder) -> Self {
        Self {
            buffer,
            bit_order,
            column: 0,
            y: 0,
        }
    }
}

impl Buffering for SimpleBuffering {
    fn reset(&mut self) {
        self.column = 0;
        self.y = 0;
    }

    fn set_buffer(&mut self, buffer: SharedBuffer) {
        self.buffer = buffer;
        self.reset();
    }

    fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    fn process_byte(&mut self, data: u8) -> Result<(), BufferError> {
        let (width, height) = {
            let mut buffer = self.buffer.write();
            let (width, height) = (buffer.width(), buffer.height());
            if height == 0 || width == 0 {
                return Err(BufferError::OutOfBounds { x: self.column, y: self.y, width, height });
            }

            // Bits past the right edge are dropped
            let end = (self.column + 8).min(width);
            for (i, x) in (self.column..end).enumerate() {
                let value = if self.bit_order.is_set(data, i) { PIXEL_ON } else { PIXEL_OFF };
                buffer.set(x, self.y, value)?;
            }
            (width, height)
        };

        self.column += 8;
        if self.column >= width {
            self.column = 0;
            self.y += 1;
            if self.y >= height {
                trace!("Frame complete, wrapping to origin");
                self.y = 0;
            }
        }
        Ok(())
    }

    fn set_page(&mut self, page: usize) -> Result<(), BufferError> {
        let height = self.buffer.read().height();
        let pages = height.div_ceil(PAGE_HEIGHT);
        if page >= pages {
            return Err(BufferError::PageOverflow { page, pages });
        }
        self.y = page * PAGE_HEIGHT;
        Ok(())
    }

    fn set_column(&mut self, column: usize) -> Result<(), BufferError> {
        let width = self.buffer.read().width();
        if column >= width {
            return Err(BufferError::ColumnOverflow { column, width });
        }
        self.column = column;
        Ok(())
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            page: self.y / PAGE_HEIGHT,
            column: self.column,
            row: self.y % PAGE_HEIGHT,
        }
    }
}

/// Page-addressed buffer, each byte a vertical 8-pixel slice
#[derive(Debug)]
pub struct PagedBuffering {
    buffer: SharedBuffer,
    bit_order: BitOrder,
    mode: AddressingMode,
    page: usize,
    column: usize,
    /// Set once the cursor has stepped past the end of its addressable range
    exhausted: bool,
}

impl PagedBuffering {
    pub fn new(buffer: SharedBuffer, bit_order: BitOrder) -> Self {
        Self {
            buffer,
            bit_order,
            mode: AddressingMode::Horizontal,
            page: 0,
            column: 0,
            exhausted: false,
        }
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AddressingMode) {
        self.mode = mode;
    }

    fn geometry(&self) -> (usize, usize, usize) {
        let buffer = self.buffer.read();
        let (width, height) = (buffer.width(), buffer.height());
        (width, height, height.div_ceil(PAGE_HEIGHT))
    }
}

impl Buffering for PagedBuffering {
    fn reset(&mut self) {
        self.page = 0;
        self.column = 0;
        self.exhausted = false;
    }

    fn set_buffer(&mut self, buffer: SharedBuffer) {
        self.buffer = buffer;
        self.reset();
    }

    fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    fn process_byte(&mut self, data: u8) -> Result<(), BufferError> {
        let (width, _, pages) = self.geometry();

        if self.exhausted || width == 0 || pages == 0 {
            return Err(match self.mode {
                AddressingMode::Horizontal => BufferError::PageOverflow { page: pages, pages },
                AddressingMode::Page => BufferError::ColumnOverflow { column: width, width },
            });
        }

        {
            let mut buffer = self.buffer.write();
            let top = self.page * PAGE_HEIGHT;
            // The last page may be cut short by the buffer height
            let rows = (buffer.height() - top).min(PAGE_HEIGHT);
            for bit in 0..rows {
                let value = if self.bit_order.is_set(data, bit) { PIXEL_ON } else { PIXEL_OFF };
                buffer.set(self.column, top + bit, value)?;
            }
        }

        if self.column + 1 < width {
            self.column += 1;
            return Ok(());
        }

        match self.mode {
            AddressingMode::Horizontal if self.page + 1 < pages => {
                self.column = 0;
                self.page += 1;
            }
            _ => self.exhausted = true,
        }
        Ok(())
    }

    fn set_page(&mut self, page: usize) -> Result<(), BufferError> {
        let (_, _, pages) = self.geometry();
        if page >= pages {
            return Err(BufferError::PageOverflow { page, pages });
        }
        self.page = page;
        self.exhausted = false;
        Ok(())
    }

    fn set_column(&mut self, column: usize) -> Result<(), BufferError> {
        let (width, _, _) = self.geometry();
        if column >= width {
            return Err(BufferError::ColumnOverflow { column, width });
        }
        self.column = column;
        self.exhausted = false;
        Ok(())
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            page: self.page,
            column: self.column,
            row: 0,
        }
    }
}

/// The strategy in use by a decoder
#[derive(Debug)]
pub enum BufferStrategy {
    Simple(SimpleBuffering),
    Paged(PagedBuffering),
}

impl BufferStrategy {
    /// Build and initialize a strategy of the given kind
    pub fn new(kind: StrategyKind, buffer: SharedBuffer, bit_order: BitOrder) -> Self {
        let mut strategy = match kind {
            StrategyKind::Simple => BufferStrategy::Simple(SimpleBuffering::new(buffer, bit_order)),
            StrategyKind::Paged => BufferStrategy::Paged(PagedBuffering::new(buffer, bit_order)),
        };
        strategy.initialize();
        strategy
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            BufferStrategy::Simple(_) => StrategyKind::Simple,
            BufferStrategy::Paged(_) => StrategyKind::Paged,
        }
    }

    fn inner(&self) -> &dyn Buffering {
        match self {
            BufferStrategy::Simple(s) => s,
            BufferStrategy::Paged(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Buffering {
        match self {
            BufferStrategy::Simple(s) => s,
            BufferStrategy::Paged(s) => s,
        }
    }

    /// Switch addressing mode. Only paged buffering has one; returns false otherwise.
    pub fn set_addressing_mode(&mut self, mode: AddressingMode) -> bool {
        match self {
            BufferStrategy::Paged(s) => {
                s.set_mode(mode);
                true
            }
            BufferStrategy::Simple(_) => false,
        }
    }
}

impl Buffering for BufferStrategy {
    fn initialize(&mut self) {
        self.inner_mut().initialize()
    }

    fn reset(&mut self) {
        self.inner_mut().reset()
    }

    fn set_buffer(&mut self, buffer: SharedBuffer) {
        self.inner_mut().set_buffer(buffer)
    }

    fn buffer(&self) -> &SharedBuffer {
        self.inner().buffer()
    }

    fn process_byte(&mut self, data: u8) -> Result<(), BufferError> {
        self.inner_mut().process_byte(data)
    }

    fn set_page(&mut self, page: usize) -> Result<(), BufferError> {
        self.inner_mut().set_page(page)
    }

    fn set_column(&mut self, column: usize) -> Result<(), BufferError> {
        self.inner_mut().set_column(column)
    }

    fn cursor(&self) -> Cursor {
        self.inner().cursor()
    }
}

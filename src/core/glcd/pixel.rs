//! Pixel buffer
//!
//! The emulated display's framebuffer: one byte per pixel, bounds-checked
//! access and a dirty region for renderers to pick up.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Pixel value for an unlit pixel
pub const PIXEL_OFF: u8 = 0;
/// Pixel value for a lit pixel
pub const PIXEL_ON: u8 = 1;

/// Errors raised by buffer writes. All of them mean the decoder's addressing
/// no longer matches what the sender intended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Pixel ({x}, {y}) is outside the {width}x{height} buffer")]
    OutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    },

    #[error("Page {page} is past the last page (pages: {pages})")]
    PageOverflow { page: usize, pages: usize },

    #[error("Column {column} is past the last column (width: {width})")]
    ColumnOverflow { column: usize, width: usize },
}

/// What to do with a coordinate outside the buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundsPolicy {
    /// Fail with [`BufferError::OutOfBounds`]
    #[default]
    Reject,
    /// Write to the nearest edge pixel instead
    Clamp,
}

/// Rectangle of pixels touched since the last `take_dirty` (inclusive bounds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl Region {
    pub fn point(x: usize, y: usize) -> Self {
        Self { x0: x, y0: y, x1: x, y1: y }
    }

    /// Grow the region to cover (x, y)
    pub fn include(&mut self, x: usize, y: usize) {
        self.x0 = self.x0.min(x);
        self.y0 = self.y0.min(y);
        self.x1 = self.x1.max(x);
        self.y1 = self.y1.max(y);
    }

    /// Smallest region covering both
    pub fn union(self, other: Region) -> Region {
        Region {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0 + 1
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0 + 1
    }
}

/// Monochrome/indexed pixel grid
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
    policy: BoundsPolicy,
    dirty: Option<Region>,
}

impl PixelBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_policy(width, height, BoundsPolicy::Reject)
    }

    pub fn with_policy(width: usize, height: usize, policy: BoundsPolicy) -> Self {
        Self {
            width,
            height,
            pixels: vec![PIXEL_OFF; width * height],
            policy,
            dirty: None,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn policy(&self) -> BoundsPolicy {
        self.policy
    }

    /// Map a coordinate to a pixel index according to the bounds policy
    fn index(&self, x: usize, y: usize) -> Result<(usize, usize, usize), BufferError> {
        if x < self.width && y < self.height {
            return Ok((x, y, y * self.width + x));
        }

        match self.policy {
            BoundsPolicy::Clamp if self.width > 0 && self.height > 0 => {
                let x = x.min(self.width - 1);
                let y = y.min(self.height - 1);
                Ok((x, y, y * self.width + x))
            }
            _ => Err(BufferError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            }),
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Result<u8, BufferError> {
        let (_, _, i) = self.index(x, y)?;
        Ok(self.pixels[i])
    }

    pub fn set(&mut self, x: usize, y: usize, value: u8) -> Result<(), BufferError> {
        let (x, y, i) = self.index(x, y)?;
        // Every write counts as a mutation, even if the value is unchanged
        self.pixels[i] = value;
        self.mark_dirty(x, y);
        Ok(())
    }

    /// Turn every pixel off
    pub fn clear(&mut self) {
        if self.pixels.iter().all(|&p| p == PIXEL_OFF) {
            return;
        }
        self.pixels.fill(PIXEL_OFF);
        if self.width > 0 && self.height > 0 {
            let full = Region {
                x0: 0,
                y0: 0,
                x1: self.width - 1,
                y1: self.height - 1,
            };
            self.dirty = Some(self.dirty.map_or(full, |d| d.union(full)));
        }
    }

    fn mark_dirty(&mut self, x: usize, y: usize) {
        match &mut self.dirty {
            Some(region) => region.include(x, y),
            None => self.dirty = Some(Region::point(x, y)),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    /// Take the dirty region, leaving the buffer clean
    pub fn take_dirty(&mut self) -> Option<Region> {
        self.dirty.take()
    }

    /// Row-major copy of all pixels
    pub fn snapshot(&self) -> Vec<u8> {
        self.pixels.clone()
    }

    pub fn count_lit(&self) -> usize {
        self.pixels.iter().filter(|&&p| p != PIXEL_OFF).count()
    }
}

impl fmt::Display for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.pixels.chunks(self.width.max(1)) {
            for &p in row {
                f.write_str(if p == PIXEL_OFF { "." } else { "#" })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Buffer shared between the listener worker (writer) and renderers (readers)
#[derive(Debug, Clone)]
pub struct SharedBuffer(Arc<RwLock<PixelBuffer>>);

impl SharedBuffer {
    pub fn new(buffer: PixelBuffer) -> Self {
        Self(Arc::new(RwLock::new(buffer)))
    }

    // A panicking writer leaves pixels in a usable state, so poisoning is ignored
    pub fn read(&self) -> RwLockReadGuard<'_, PixelBuffer> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PixelBuffer> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.read().snapshot()
    }

    pub fn take_dirty(&self) -> Option<Region> {
        self.write().take_dirty()
    }
}

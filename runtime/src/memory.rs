//! WASM linear memory management.
//!
//! Allocation happens at instantiation time (`RuntimeError` on bad limits);
//! every access afterwards is bounds-checked and reports a `TrapError`.

use alloc::vec::Vec;

use crate::interpreter::TrapError;
use crate::RuntimeError;

/// Page size in bytes (64 KB).
pub const PAGE_SIZE: usize = 65536;

/// Maximum number of pages (4 GB).
pub const MAX_PAGES: u32 = 65536;

/// Linear memory for a WASM instance.
#[derive(Debug)]
pub struct LinearMemory {
    /// Memory data.
    data: Vec<u8>,

    /// Current size in pages.
    current_pages: u32,

    /// Maximum size in pages (if specified).
    max_pages: Option<u32>,
}

impl LinearMemory {
    /// Create a new linear memory.
    pub fn new(initial_pages: u32, max_pages: Option<u32>) -> Result<Self, RuntimeError> {
        if initial_pages > MAX_PAGES {
            return Err(RuntimeError::MemoryError(
                "Initial memory size exceeds maximum".into(),
            ));
        }

        if let Some(max) = max_pages {
            if max > MAX_PAGES {
                return Err(RuntimeError::MemoryError(
                    "Maximum memory size exceeds limit".into(),
                ));
            }
            if initial_pages > max {
                return Err(RuntimeError::MemoryError(
                    "Initial pages exceeds maximum pages".into(),
                ));
            }
        }

        let mut data = Vec::new();
        data.resize(initial_pages as usize * PAGE_SIZE, 0);

        Ok(LinearMemory {
            data,
            current_pages: initial_pages,
            max_pages,
        })
    }

    /// Get the current size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the current size in pages.
    pub fn pages(&self) -> u32 {
        self.current_pages
    }

    /// Get the maximum size in pages.
    pub fn max_pages(&self) -> Option<u32> {
        self.max_pages
    }

    /// Grow memory by the specified number of pages.
    ///
    /// Returns the previous size in pages, or `None` if the limit would be
    /// exceeded (`memory.grow` then yields -1 rather than trapping).
    pub fn grow(&mut self, delta_pages: u32) -> Option<u32> {
        let new_pages = self.current_pages.checked_add(delta_pages)?;
        if new_pages > self.max_pages.unwrap_or(MAX_PAGES) {
            return None;
        }

        let old_pages = self.current_pages;
        self.data.resize(new_pages as usize * PAGE_SIZE, 0);
        self.current_pages = new_pages;
        Some(old_pages)
    }

    /// Read a u32 from memory (little-endian).
    pub fn read_u32(&self, offset: usize) -> Result<u32, TrapError> {
        let range = self.check_bounds(offset, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[range]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a u32 to memory (little-endian).
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), TrapError> {
        let range = self.check_bounds(offset, 4)?;
        self.data[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read bytes from memory.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8], TrapError> {
        let range = self.check_bounds(offset, len)?;
        Ok(&self.data[range])
    }

    /// Write bytes to memory.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), TrapError> {
        let range = self.check_bounds(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<core::ops::Range<usize>, TrapError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(TrapError::MemoryOutOfBounds {
                offset,
                size: len,
                memory_size: self.data.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip_within_bounds() {
        let mut mem = LinearMemory::new(1, Some(2)).unwrap();
        mem.write_u32(PAGE_SIZE - 4, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(PAGE_SIZE - 4).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_out_of_bounds_access_traps() {
        let mem = LinearMemory::new(1, None).unwrap();
        assert_eq!(
            mem.read_u32(PAGE_SIZE - 2),
            Err(TrapError::MemoryOutOfBounds {
                offset: PAGE_SIZE - 2,
                size: 4,
                memory_size: PAGE_SIZE,
            })
        );
        assert!(mem.read_bytes(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_grow_respects_max() {
        let mut mem = LinearMemory::new(1, Some(2)).unwrap();
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.pages(), 2);
        assert_eq!(mem.size(), 2 * PAGE_SIZE);
        assert_eq!(mem.grow(1), None);
    }

    #[test]
    fn test_initial_above_max_rejected() {
        assert!(LinearMemory::new(3, Some(2)).is_err());
    }
}

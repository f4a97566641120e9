//! Guest memory access port.
//!
//! Virtqueues live in memory owned by the driver. The engine never keeps pointers into that memory:
//! every ring or buffer access asks the embedding environment for a borrowed slice that is only
//! valid for the duration of a single call. A range that cannot be resolved is reported as an error
//! and never dereferenced.

use thiserror::Error;

/// Requested access mode for a memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn is_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// An inclusive guest address range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Builds the range covering `len` bytes starting at `start`.
    ///
    /// Returns `None` for empty ranges and for ranges that would wrap the address space.
    pub fn from_len(start: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let end = start.checked_add(len - 1)?;
        Some(Self { start, end })
    }

    pub fn length(&self) -> u64 {
        self.end.wrapping_sub(self.start).wrapping_add(1)
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end
    }

    pub fn includes(&self, other: &AddrRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl core::fmt::Display for AddrRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[0x{:016x}..0x{:016x}]", self.start, self.end)
    }
}

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    /// The requested range is not host accessible (outside RAM or currently unmapped).
    #[error("guest memory access out of range: paddr=0x{paddr:x} len={len}")]
    OutOfRange { paddr: u64, len: usize },
    /// The requested range is mapped but may not be written.
    #[error("guest memory is read-only: paddr=0x{paddr:x} len={len}")]
    ReadOnly { paddr: u64, len: usize },
    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("guest memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Guest *physical* memory as seen by a virtio device.
///
/// `get_slice`/`get_slice_mut` are the resolution primitives: they must be idempotent and free of
/// side effects for the same arguments. Everything else is derived from them.
pub trait GuestMemory {
    fn size(&self) -> u64;

    /// Resolves `len` bytes at `paddr` for reading.
    fn get_slice(&self, paddr: u64, len: usize) -> Option<&[u8]>;

    /// Resolves `len` bytes at `paddr` for writing.
    fn get_slice_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]>;

    /// Checks whether `len` bytes at `paddr` can be resolved with the requested access mode.
    fn resolve(&mut self, paddr: u64, len: u64, access: Access) -> GuestMemoryResult<()> {
        let len = usize::try_from(len).map_err(|_| GuestMemoryError::SizeTooLarge { size: len })?;
        if self.get_slice(paddr, len).is_none() {
            return Err(GuestMemoryError::OutOfRange { paddr, len });
        }
        if access.is_write() && self.get_slice_mut(paddr, len).is_none() {
            return Err(GuestMemoryError::ReadOnly { paddr, len });
        }
        Ok(())
    }

    /// Reads bytes from guest physical memory into `dst`.
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let src = self
            .get_slice(paddr, dst.len())
            .ok_or(GuestMemoryError::OutOfRange {
                paddr,
                len: dst.len(),
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Writes bytes from `src` into guest physical memory.
    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let dst = self
            .get_slice_mut(paddr, src.len())
            .ok_or(GuestMemoryError::OutOfRange {
                paddr,
                len: src.len(),
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn read_u16_le(&self, paddr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u16_le(&mut self, paddr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u32_le(&mut self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, paddr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }
}

pub fn read_u16_le<M: GuestMemory + ?Sized>(mem: &M, paddr: u64) -> GuestMemoryResult<u16> {
    mem.read_u16_le(paddr)
}

pub fn read_u32_le<M: GuestMemory + ?Sized>(mem: &M, paddr: u64) -> GuestMemoryResult<u32> {
    mem.read_u32_le(paddr)
}

pub fn read_u64_le<M: GuestMemory + ?Sized>(mem: &M, paddr: u64) -> GuestMemoryResult<u64> {
    mem.read_u64_le(paddr)
}

pub fn write_u16_le<M: GuestMemory + ?Sized>(
    mem: &mut M,
    paddr: u64,
    value: u16,
) -> GuestMemoryResult<()> {
    mem.write_u16_le(paddr, value)
}

pub fn write_u32_le<M: GuestMemory + ?Sized>(
    mem: &mut M,
    paddr: u64,
    value: u32,
) -> GuestMemoryResult<()> {
    mem.write_u32_le(paddr, value)
}

pub fn write_u64_le<M: GuestMemory + ?Sized>(
    mem: &mut M,
    paddr: u64,
    value: u64,
) -> GuestMemoryResult<()> {
    mem.write_u64_le(paddr, value)
}

/// Flat guest RAM starting at guest physical address 0.
///
/// Parts of the RAM can be unmapped or made read-only to model a guest that remaps its memory
/// while a queue is live.
#[derive(Debug, Clone)]
pub struct GuestRam {
    data: Vec<u8>,
    holes: Vec<AddrRange>,
    read_only: Vec<AddrRange>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            holes: Vec::new(),
            read_only: Vec::new(),
        }
    }

    /// Makes `range` inaccessible until it is restored.
    pub fn unmap(&mut self, range: AddrRange) {
        self.holes.push(range);
    }

    /// Drops every hole overlapping `range`.
    pub fn restore(&mut self, range: AddrRange) {
        self.holes.retain(|hole| !hole.overlaps(&range));
    }

    pub fn set_read_only(&mut self, range: AddrRange) {
        self.read_only.push(range);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn span(&self, paddr: u64, len: usize) -> Option<(usize, usize)> {
        let start = usize::try_from(paddr).ok()?;
        let end = start.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        if let Some(range) = AddrRange::from_len(paddr, len as u64) {
            if self.holes.iter().any(|hole| hole.overlaps(&range)) {
                return None;
            }
        }
        Some((start, end))
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn get_slice(&self, paddr: u64, len: usize) -> Option<&[u8]> {
        let (start, end) = self.span(paddr, len)?;
        Some(&self.data[start..end])
    }

    fn get_slice_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        let (start, end) = self.span(paddr, len)?;
        if let Some(range) = AddrRange::from_len(paddr, len as u64) {
            if self.read_only.iter().any(|ro| ro.overlaps(&range)) {
                return None;
            }
        }
        Some(&mut self.data[start..end])
    }
}

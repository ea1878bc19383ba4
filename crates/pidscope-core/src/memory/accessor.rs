//! Bounds-checked access to host memory
//!
//! This is the only place host addresses are dereferenced. Every other
//! component works with [`KernelPtr`] handles and offsets into a [`Window`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::host::RawMemory;
use crate::memory::layout::{POINTER_WIDTH, scan::SNAPSHOT_CHUNK};

/// An address that carries the kernel address marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelPtr(u64);

impl KernelPtr {
    #[inline]
    pub fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KernelPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Host memory plus the address sanity gate.
#[derive(Clone)]
pub struct MemoryAccessor {
    memory: Arc<dyn RawMemory>,
    kernel_marker: u64,
}

impl MemoryAccessor {
    pub fn new(memory: Arc<dyn RawMemory>, kernel_marker: u64) -> Self {
        Self {
            memory,
            kernel_marker,
        }
    }

    #[inline]
    pub fn is_kernel_address(&self, address: u64) -> bool {
        address & self.kernel_marker == self.kernel_marker
    }

    /// Validate a raw address before anything dereferences it.
    pub fn handle(&self, address: u64) -> Result<KernelPtr> {
        if self.is_kernel_address(address) {
            Ok(KernelPtr(address))
        } else {
            Err(Error::NotKernelAddress(address))
        }
    }

    /// Handle for `base + offset`, validated like [`Self::handle`].
    pub fn offset_handle(&self, base: KernelPtr, offset: usize) -> Result<KernelPtr> {
        let address = base
            .0
            .checked_add(offset as u64)
            .ok_or(Error::NotKernelAddress(u64::MAX))?;
        self.handle(address)
    }

    /// Bound all further access to `[base, base + len)`.
    pub fn window(&self, base: KernelPtr, len: usize) -> Window<'_> {
        let len = len.min((u64::MAX - base.0) as usize);
        Window {
            accessor: self,
            base,
            len,
        }
    }
}

impl fmt::Debug for MemoryAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAccessor")
            .field("kernel_marker", &format_args!("{:#x}", self.kernel_marker))
            .finish_non_exhaustive()
    }
}

/// A caller-supplied bound over host memory.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    accessor: &'a MemoryAccessor,
    base: KernelPtr,
    len: usize,
}

impl<'a> Window<'a> {
    #[inline]
    pub fn base(&self) -> KernelPtr {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn accessor(&self) -> &'a MemoryAccessor {
        self.accessor
    }

    /// Absolute address of `offset`, for logging and link comparisons.
    #[inline]
    pub fn address_of(&self, offset: usize) -> u64 {
        self.base.0 + offset as u64
    }

    fn check(&self, offset: usize, len: usize) -> Result<u64> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.address_of(offset)),
            _ => Err(Error::OutOfRange {
                offset,
                len,
                bound: self.len,
            }),
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let address = self.check(offset, len)?;
        let bytes = self.accessor.memory.read_bytes(address, len)?;
        if bytes.len() != len {
            return Err(Error::Unmapped { address, len });
        }
        Ok(bytes)
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let address = self.check(offset, bytes.len())?;
        self.accessor.memory.write_bytes(address, bytes)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_ptr(&self, offset: usize) -> Result<u64> {
        let bytes = self.read(offset, POINTER_WIDTH)?;
        let mut raw = [0u8; POINTER_WIDTH];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Copy the window out in chunks, stopping at the first unreadable chunk.
    ///
    /// The returned buffer may be shorter than the window. An entirely
    /// unreadable window is an error.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.len);
        let mut offset = 0;

        while offset < self.len {
            let size = SNAPSHOT_CHUNK.min(self.len - offset);
            match self.read(offset, size) {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) if buffer.is_empty() => return Err(e),
                Err(e) => {
                    debug!(
                        "Snapshot of {} truncated at {:#x}: {}",
                        self.base, offset, e
                    );
                    break;
                }
            }
            offset += size;
        }

        Ok(buffer)
    }
}

//! Signature matching over a bounded memory window
//!
//! All searches return the first matching offset. Multiple plausible matches
//! are never disambiguated beyond their position in the window.

use memchr::memmem;
use tracing::trace;

use crate::error::Result;
use crate::memory::Window;
use crate::memory::layout::{LINK_NODE_SIZE, POINTER_WIDTH};

/// First offset (multiple of `stride`) holding `value` as a little-endian u32
pub fn find_int(buffer: &[u8], value: u32, stride: usize) -> Option<usize> {
    let needle = value.to_le_bytes();
    let stride = stride.max(1);

    (0..buffer.len().saturating_sub(needle.len() - 1))
        .step_by(stride)
        .find(|&pos| buffer[pos..pos + needle.len()] == needle)
}

/// First offset of `pattern` immediately followed by a NUL terminator
pub fn find_string(buffer: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() {
        return None;
    }

    memmem::find_iter(buffer, pattern).find(|&pos| buffer.get(pos + pattern.len()) == Some(&0))
}

/// A window snapshot plus the ability to follow pointers out of it.
pub struct SignatureMatcher<'a> {
    window: Window<'a>,
    buffer: Vec<u8>,
}

impl<'a> SignatureMatcher<'a> {
    pub fn load(window: Window<'a>) -> Result<Self> {
        let buffer = window.snapshot()?;
        trace!(
            "Loaded {:#x} of {:#x} bytes at {}",
            buffer.len(),
            window.len(),
            window.base()
        );
        Ok(Self { window, buffer })
    }

    /// Number of bytes actually captured from the window
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn find_int(&self, value: u32, stride: usize) -> Option<usize> {
        find_int(&self.buffer, value, stride)
    }

    pub fn find_string(&self, pattern: &[u8]) -> Option<usize> {
        find_string(&self.buffer, pattern)
    }

    /// First pointer-aligned offset holding a consistent list node.
    ///
    /// The pair at `offset` is read as (forward, backward). It is accepted
    /// when both pointers carry the kernel marker and the node the forward
    /// pointer leads to points back at `offset`.
    pub fn find_self_referential_link(&self, stride: usize) -> Option<usize> {
        let stride = stride.max(POINTER_WIDTH);
        let last = self.buffer.len().checked_sub(LINK_NODE_SIZE)?;

        (0..=last)
            .step_by(stride)
            .find(|&offset| self.is_link_node(offset))
    }

    fn pointer_at(&self, offset: usize) -> u64 {
        let mut raw = [0u8; POINTER_WIDTH];
        raw.copy_from_slice(&self.buffer[offset..offset + POINTER_WIDTH]);
        u64::from_le_bytes(raw)
    }

    fn is_link_node(&self, offset: usize) -> bool {
        let accessor = self.window.accessor();
        let forward = self.pointer_at(offset);
        let backward = self.pointer_at(offset + POINTER_WIDTH);

        if !accessor.is_kernel_address(backward) {
            return false;
        }
        let Ok(next) = accessor.handle(forward) else {
            return false;
        };

        match accessor
            .window(next, LINK_NODE_SIZE)
            .read_ptr(POINTER_WIDTH)
        {
            Ok(back_link) => back_link == self.window.address_of(offset),
            Err(e) => {
                trace!("Link candidate {:#x}: {}", offset, e);
                false
            }
        }
    }
}

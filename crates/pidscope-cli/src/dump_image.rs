//! Raw memory dump served through the `RawMemory` capability.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use pidscope_core::RawMemory;
use tracing::debug;

/// A read-only copy of host memory that starts at `base`.
pub struct DumpImage {
    base: u64,
    bytes: Vec<u8>,
}

impl DumpImage {
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    pub fn open(path: &Path, base: u64) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read dump {}", path.display()))?;
        debug!(
            "Loaded {} bytes from {} at {:#x}",
            bytes.len(),
            path.display(),
            base
        );
        Ok(Self::new(base, bytes))
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, address: u64, size: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(size)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

impl RawMemory for DumpImage {
    fn read_bytes(&self, address: u64, size: usize) -> pidscope_core::Result<Vec<u8>> {
        self.range(address, size)
            .map(|range| self.bytes[range].to_vec())
            .ok_or(pidscope_core::Error::Unmapped { address, len: size })
    }

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> pidscope_core::Result<()> {
        Err(pidscope_core::Error::Unmapped {
            address,
            len: bytes.len(),
        })
    }
}

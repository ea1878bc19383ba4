//! Memory layout constants for process descriptors
//!
//! This module centralizes the fixed sizes used while scanning descriptors and
//! the static fallback offset table used when calibration fails.

use crate::offset::LayoutOffsets;

/// Pointer size of the supported hosts (64-bit only)
pub const POINTER_WIDTH: usize = 8;

/// Fixed size of a descriptor's short name field, terminator included
pub const NAME_LEN: usize = 16;

/// Size of a doubly-linked list node (forward + backward pointer)
pub const LINK_NODE_SIZE: usize = POINTER_WIDTH * 2;

/// Size of the identifier field
pub const IDENTIFIER_SIZE: usize = 4;

/// Scanning parameters
pub mod scan {
    /// Default calibration window (8KB)
    pub const DEFAULT_WINDOW: usize = 0x2000;

    /// Hard cap for any calibration window (16KB)
    pub const MAX_WINDOW: usize = 0x4000;

    /// Chunk size used when snapshotting a window
    pub const SNAPSHOT_CHUNK: usize = 0x100;

    /// Identifier fields are 4-byte aligned
    pub const IDENTIFIER_STRIDE: usize = 4;

    /// Link fields are pointer aligned
    pub const LINK_STRIDE: usize = super::POINTER_WIDTH;

    /// Default ceiling for process list walks
    pub const MAX_WALK_NODES: usize = 32768;

    /// Top 16 bits set: kernel half of a 48-bit canonical address space
    pub const KERNEL_ADDRESS_MARKER: u64 = 0xFFFF_0000_0000_0000;
}

/// A named, best-effort offset table for one OS build family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackProfile {
    pub name: &'static str,
    pub offsets: LayoutOffsets,
}

/// Static fallback profiles. The first entry is the default.
///
/// These offsets are placeholders, not values taken from a particular
/// kernel build. They only give a fallback of the right shape: each fits
/// inside `scan::MAX_WINDOW` and keeps the three fields apart. Before relying
/// on a profile, replace it with the real offsets of the target build family
/// (e.g. from `pahole -C task_struct vmlinux`) or supply
/// `scan.fallback_offsets` in the configuration.
pub const FALLBACK_PROFILES: &[FallbackProfile] = &[
    FallbackProfile {
        name: "android-gki-5.10-arm64",
        offsets: LayoutOffsets {
            identifier: 0x5C8,
            name: 0x760,
            link: 0x4C8,
        },
    },
    FallbackProfile {
        name: "android-gki-5.15-arm64",
        offsets: LayoutOffsets {
            identifier: 0x5E0,
            name: 0x790,
            link: 0x4E0,
        },
    },
    FallbackProfile {
        name: "linux-6.x-x86_64",
        offsets: LayoutOffsets {
            identifier: 0x9A8,
            name: 0xC08,
            link: 0x8F0,
        },
    },
];

/// Look up a fallback profile by name, defaulting to the first entry.
pub fn fallback_profile(name: &str) -> &'static FallbackProfile {
    FALLBACK_PROFILES
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .unwrap_or(&FALLBACK_PROFILES[0])
}

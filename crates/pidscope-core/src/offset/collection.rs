use serde::{Deserialize, Serialize};

use crate::memory::layout::{IDENTIFIER_SIZE, LINK_NODE_SIZE, NAME_LEN};

/// Byte offsets of the three fields pidscope reads from a process descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutOffsets {
    pub identifier: usize,
    pub name: usize,
    pub link: usize,
}

impl LayoutOffsets {
    /// Bytes of a descriptor that must be readable to use these offsets
    pub fn span(&self) -> usize {
        (self.identifier + IDENTIFIER_SIZE)
            .max(self.name + NAME_LEN)
            .max(self.link + LINK_NODE_SIZE)
    }

    /// All three fields lie inside a window of `bound` bytes
    pub fn is_within(&self, bound: usize) -> bool {
        self.span() <= bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_and_bounds() {
        let offsets = LayoutOffsets {
            identifier: 0x100,
            name: 0x200,
            link: 0x80,
        };
        assert_eq!(offsets.span(), 0x210);
        assert!(offsets.is_within(0x210));
        assert!(!offsets.is_within(0x20F));
    }

    #[test]
    fn test_json_shape() {
        let offsets = LayoutOffsets {
            identifier: 8,
            name: 16,
            link: 32,
        };
        let json = serde_json::to_string(&offsets).unwrap();
        assert_eq!(json, r#"{"identifier":8,"name":16,"link":32}"#);
        let parsed: LayoutOffsets = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, offsets);
    }
}

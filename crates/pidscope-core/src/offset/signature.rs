use std::fmt;

use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::layout::NAME_LEN;

/// Fixed-length process name pattern with exact-match semantics.
///
/// Holds at most `NAME_LEN - 1` bytes, the same limit the host applies to
/// descriptor names, so longer names are truncated the way the host
/// truncates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSignature {
    bytes: [u8; NAME_LEN],
    len: usize,
}

impl TargetSignature {
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidTarget("name is empty".to_string()));
        }
        if name.as_bytes().contains(&0) {
            return Err(Error::InvalidTarget(format!(
                "name {:?} contains a NUL byte",
                name
            )));
        }

        let len = name.len().min(NAME_LEN - 1);
        if len < name.len() {
            warn!(
                "Target name {:?} truncated to {} bytes",
                name,
                NAME_LEN - 1
            );
        }

        let mut bytes = [0u8; NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Ok(Self { bytes, len })
    }

    /// Parse a load argument string, using `default` when it is blank
    pub fn from_args(args: &str, default: &str) -> Result<Self> {
        let args = args.trim();
        if args.is_empty() {
            Self::parse(default)
        } else {
            Self::parse(args)
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Compare against a raw name field.
    ///
    /// The field ends at its first NUL (or after `NAME_LEN` bytes) and must
    /// equal the pattern exactly; a prefix never matches.
    pub fn matches(&self, field: &[u8]) -> bool {
        name_field(field) == self.as_bytes()
    }
}

impl fmt::Display for TargetSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// The meaningful part of a raw name field
pub fn name_field(field: &[u8]) -> &[u8] {
    let field = &field[..field.len().min(NAME_LEN)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Encode a name the way the host stores it: NUL padded to `NAME_LEN`
pub fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut field = [0u8; NAME_LEN];
    let len = name.len().min(NAME_LEN - 1);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let sig = TargetSignature::parse("worker-proc").unwrap();
        assert!(sig.matches(&encode_name("worker-proc")));
        assert!(sig.matches(b"worker-proc\0garbage"));
    }

    #[test]
    fn test_prefix_never_matches() {
        let sig = TargetSignature::parse("worker").unwrap();
        assert!(!sig.matches(&encode_name("worker-proc")));

        let sig = TargetSignature::parse("worker-proc").unwrap();
        assert!(!sig.matches(&encode_name("worker")));
    }

    #[test]
    fn test_long_name_truncated_like_host() {
        let sig = TargetSignature::parse("a-very-long-process-name").unwrap();
        assert_eq!(sig.as_bytes(), b"a-very-long-pro");
        assert!(sig.matches(&encode_name("a-very-long-process-name")));
    }

    #[test]
    fn test_field_without_terminator() {
        let sig = TargetSignature::parse("abcdefghijklmno").unwrap();
        let mut field = [b'x'; NAME_LEN];
        field[..15].copy_from_slice(b"abcdefghijklmno");
        // 16 bytes with no terminator: the sixteenth byte is part of the name
        assert!(!sig.matches(&field));
        field[15] = 0;
        assert!(sig.matches(&field));
    }

    #[test]
    fn test_invalid_names() {
        assert!(TargetSignature::parse("").is_err());
        assert!(TargetSignature::parse("bad\0name").is_err());
    }

    #[test]
    fn test_from_args_default() {
        assert_eq!(
            TargetSignature::from_args("  ", "init").unwrap().to_string(),
            "init"
        );
        assert_eq!(
            TargetSignature::from_args(" worker-proc\n", "init")
                .unwrap()
                .to_string(),
            "worker-proc"
        );
    }
}

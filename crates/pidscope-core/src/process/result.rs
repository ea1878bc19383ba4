use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use strum::{FromRepr, IntoStaticStr};

/// Failure reasons surfaced through the result channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr, Serialize)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StatusError {
    NoAnchor = 0,
    WalkLimit = 1,
    MemoryFault = 2,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.into())
    }
}

/// Current state of the target search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Found(u32),
    NotYetRunning,
    Error(StatusError),
}

impl DiscoveryStatus {
    /// Channel value: decimal identifier, `not_found` or `error:<reason>`
    pub fn token(&self) -> String {
        match self {
            DiscoveryStatus::Found(id) => id.to_string(),
            DiscoveryStatus::NotYetRunning => "not_found".to_string(),
            DiscoveryStatus::Error(kind) => format!("error:{}", kind),
        }
    }

    fn encode(self) -> i64 {
        match self {
            DiscoveryStatus::Found(id) => id as i64,
            DiscoveryStatus::NotYetRunning => NOT_YET_RUNNING,
            DiscoveryStatus::Error(kind) => ERROR_BASE - kind as i64,
        }
    }

    fn decode(raw: i64) -> Self {
        if raw >= 0 {
            return DiscoveryStatus::Found(raw as u32);
        }
        if raw == NOT_YET_RUNNING {
            return DiscoveryStatus::NotYetRunning;
        }
        u8::try_from(ERROR_BASE - raw)
            .ok()
            .and_then(StatusError::from_repr)
            .map(DiscoveryStatus::Error)
            .unwrap_or(DiscoveryStatus::Error(StatusError::MemoryFault))
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

const NOT_YET_RUNNING: i64 = -1;
const ERROR_BASE: i64 = -2;

/// The shared result slot.
///
/// The whole status lives in one atomic integer so concurrent readers never
/// observe a partially written value.
#[derive(Debug)]
pub struct DiscoveredResult {
    raw: AtomicI64,
}

impl DiscoveredResult {
    pub fn new() -> Self {
        Self {
            raw: AtomicI64::new(NOT_YET_RUNNING),
        }
    }

    pub fn load(&self) -> DiscoveryStatus {
        DiscoveryStatus::decode(self.raw.load(Ordering::Acquire))
    }

    pub fn store(&self, status: DiscoveryStatus) {
        self.raw.store(status.encode(), Ordering::Release);
    }

    /// Store `status`, returning the previous value
    pub fn swap(&self, status: DiscoveryStatus) -> DiscoveryStatus {
        DiscoveryStatus::decode(self.raw.swap(status.encode(), Ordering::AcqRel))
    }
}

impl Default for DiscoveredResult {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert_eq!(DiscoveredResult::new().load(), DiscoveryStatus::NotYetRunning);
    }

    #[test]
    fn test_store_and_load() {
        let slot = DiscoveredResult::new();
        for status in [
            DiscoveryStatus::Found(0),
            DiscoveryStatus::Found(4242),
            DiscoveryStatus::Found(u32::MAX),
            DiscoveryStatus::NotYetRunning,
            DiscoveryStatus::Error(StatusError::NoAnchor),
            DiscoveryStatus::Error(StatusError::WalkLimit),
            DiscoveryStatus::Error(StatusError::MemoryFault),
        ] {
            slot.store(status);
            assert_eq!(slot.load(), status);
        }
    }

    #[test]
    fn test_swap_returns_previous() {
        let slot = DiscoveredResult::new();
        assert_eq!(
            slot.swap(DiscoveryStatus::Found(7)),
            DiscoveryStatus::NotYetRunning
        );
        assert_eq!(slot.load(), DiscoveryStatus::Found(7));
    }

    #[test]
    fn test_tokens() {
        assert_eq!(DiscoveryStatus::Found(4242).token(), "4242");
        assert_eq!(DiscoveryStatus::NotYetRunning.token(), "not_found");
        assert_eq!(
            DiscoveryStatus::Error(StatusError::WalkLimit).token(),
            "error:walk_limit"
        );
        assert_eq!(
            DiscoveryStatus::Error(StatusError::NoAnchor).to_string(),
            "error:no_anchor"
        );
    }
}

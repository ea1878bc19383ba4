use thiserror::Error;

use crate::offset::CalibrationFailure;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Symbol not resolved: {0}")]
    SymbolUnresolved(String),

    #[error("Calibration failed: {0}")]
    CalibrationFailed(CalibrationFailure),

    #[error("Failed to install interception on {entry}: {reason}")]
    InterceptionInstallFailed { entry: String, reason: String },

    #[error("Access of {len} bytes at offset {offset:#x} is outside a {bound:#x}-byte window")]
    OutOfRange {
        offset: usize,
        len: usize,
        bound: usize,
    },

    #[error("Host rejected access of {len} bytes at address {address:#x}")]
    Unmapped { address: u64, len: usize },

    #[error("Address {0:#x} does not carry the kernel address marker")]
    NotKernelAddress(u64),

    #[error("Process list walk exceeded {limit} nodes")]
    WalkLimitExceeded { limit: usize },

    #[error("Invalid target name: {0}")]
    InvalidTarget(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error came from a single failed memory access
    pub fn is_memory_fault(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. } | Error::Unmapped { .. } | Error::NotKernelAddress(_)
        )
    }

    /// Negative errno-style status reported by the load entry point
    pub fn status_code(&self) -> i64 {
        match self {
            Error::SymbolUnresolved(_) => -2,
            Error::Unmapped { .. } | Error::OutOfRange { .. } | Error::NotKernelAddress(_) => -14,
            Error::InterceptionInstallFailed { .. } | Error::InvalidState(_) => -16,
            Error::InvalidTarget(_) | Error::Config(_) => -22,
            _ => -1,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

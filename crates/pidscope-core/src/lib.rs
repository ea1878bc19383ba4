//! # pidscope-core
//!
//! Core library for locating a process by name on a host whose process
//! descriptor layout is unknown at build time.
//!
//! This crate provides:
//! - Layout calibration against a known reference descriptor
//! - Bounded traversal of the live process list
//! - Publishing the result through a recoverable text channel
//! - Interception of the identifier query and channel reads
//!
//! All host access goes through the capability traits in [`host`].
//!
//! ## Feature Flags
//!
//! - `simulator`: Enables [`host::sim`], an in-process host with a synthetic
//!   process list, used by the CLI and the tests.

pub mod channel;
pub mod config;
pub mod error;
pub mod finder;
pub mod host;
pub mod intercept;
pub mod memory;
pub mod offset;
pub mod process;

pub use channel::{ChannelBackup, ResultChannel};
pub use config::{PidscopeConfig, PidscopeConfigBuilder};
pub use error::{Error, Result};
pub use finder::{PidFinder, load_entry, unload_entry};
pub use host::{
    CallFrame, CallInterceptor, CallObserver, HookId, HostServices, RawMemory, SymbolResolver,
};
pub use intercept::{ControllerPhase, InterceptionController};
pub use memory::{KernelPtr, MemoryAccessor};
pub use offset::{
    Calibration, CalibrationFailure, Calibrator, Confidence, LayoutOffsets, ReferenceDescriptor,
    TargetSignature,
};
pub use process::{DiscoveredResult, DiscoveryStatus, ProcessListWalker, StatusError};

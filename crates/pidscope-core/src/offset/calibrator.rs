//! Layout calibration against a known reference descriptor
//!
//! # Strategy
//!
//! The reference descriptor's identifier and name are known in advance, so
//! their offsets can be found by scanning the descriptor for those values.
//! The link field is the first pointer pair that forms a consistent list
//! node. The result is only trusted after re-reading the same descriptor
//! through the discovered offsets; otherwise a static fallback profile is
//! used.

use std::fmt;

use serde::Serialize;
use strum::IntoStaticStr;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::layout::{
    FallbackProfile, LINK_NODE_SIZE, NAME_LEN, POINTER_WIDTH,
    scan::{IDENTIFIER_STRIDE, LINK_STRIDE, MAX_WINDOW},
};
use crate::memory::{KernelPtr, MemoryAccessor};
use crate::offset::{LayoutOffsets, SignatureMatcher, TargetSignature};

/// The well-known descriptor used for calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceDescriptor {
    pub expected_id: u32,
    pub expected_name: TargetSignature,
    pub base: KernelPtr,
}

impl ReferenceDescriptor {
    pub fn new(expected_id: u32, expected_name: &str, base: KernelPtr) -> Result<Self> {
        if expected_id == 0 {
            return Err(Error::InvalidTarget(
                "reference identifier must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            expected_id,
            expected_name: TargetSignature::parse(expected_name)?,
            base,
        })
    }
}

/// Why a calibration attempt was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CalibrationFailure {
    SymbolUnresolved,
    NoIdentifierMatch,
    NoNameMatch,
    NoLinkMatch,
    VerificationMismatch,
    MemoryUnavailable,
}

impl fmt::Display for CalibrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.into())
    }
}

/// How far the offsets in a [`Calibration`] can be trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Confidence {
    Verified,
    Fallback {
        profile: String,
        reason: CalibrationFailure,
    },
}

/// Offsets plus the confidence they were obtained with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Calibration {
    pub offsets: LayoutOffsets,
    pub confidence: Confidence,
}

impl Calibration {
    pub fn is_verified(&self) -> bool {
        self.confidence == Confidence::Verified
    }
}

pub struct Calibrator<'a> {
    accessor: &'a MemoryAccessor,
    window: usize,
    fallback_name: String,
    fallback: LayoutOffsets,
}

impl<'a> Calibrator<'a> {
    pub fn new(accessor: &'a MemoryAccessor, window: usize, fallback: &FallbackProfile) -> Self {
        Self::with_fallback(accessor, window, fallback.name, fallback.offsets)
    }

    /// Use a fallback table that is not one of the built-in profiles
    pub fn with_fallback(
        accessor: &'a MemoryAccessor,
        window: usize,
        fallback_name: &str,
        fallback: LayoutOffsets,
    ) -> Self {
        Self {
            accessor,
            window: window.clamp(LINK_NODE_SIZE, MAX_WINDOW),
            fallback_name: fallback_name.to_string(),
            fallback,
        }
    }

    /// Discover and verify the layout of `reference`.
    ///
    /// Either all three offsets are found and verified, or the attempt
    /// fails as a whole.
    pub fn calibrate(&self, reference: &ReferenceDescriptor) -> Result<LayoutOffsets> {
        debug!(
            "Calibrating against {} (id={}, name={:?}), window {:#x}",
            reference.base, reference.expected_id, reference.expected_name.to_string(), self.window
        );

        let window = self.accessor.window(reference.base, self.window);
        let matcher = SignatureMatcher::load(window).map_err(|e| {
            debug!("  Reference window unreadable: {}", e);
            Error::CalibrationFailed(CalibrationFailure::MemoryUnavailable)
        })?;

        let identifier = matcher
            .find_int(reference.expected_id, IDENTIFIER_STRIDE)
            .ok_or(Error::CalibrationFailed(CalibrationFailure::NoIdentifierMatch))?;
        debug!("  Identifier: {:#x}", identifier);

        let name = matcher
            .find_string(reference.expected_name.as_bytes())
            .ok_or(Error::CalibrationFailed(CalibrationFailure::NoNameMatch))?;
        debug!("  Name: {:#x}", name);

        let link = matcher
            .find_self_referential_link(LINK_STRIDE)
            .ok_or(Error::CalibrationFailed(CalibrationFailure::NoLinkMatch))?;
        debug!("  Link: {:#x}", link);

        let offsets = LayoutOffsets {
            identifier,
            name,
            link,
        };
        self.verify(reference, &offsets)?;

        Ok(offsets)
    }

    /// Re-read `reference` through `offsets` and compare to the expected values
    pub fn verify(&self, reference: &ReferenceDescriptor, offsets: &LayoutOffsets) -> Result<()> {
        let mismatch = Error::CalibrationFailed(CalibrationFailure::VerificationMismatch);

        if !offsets.is_within(self.window) {
            debug!("Verification failed: {:?} exceeds window", offsets);
            return Err(mismatch);
        }

        let window = self.accessor.window(reference.base, offsets.span());

        let id = window.read_u32(offsets.identifier).map_err(|e| {
            debug!("Verification failed: identifier unreadable: {}", e);
            Error::CalibrationFailed(CalibrationFailure::VerificationMismatch)
        })?;
        if id != reference.expected_id {
            debug!(
                "Verification failed: identifier {} != {}",
                id, reference.expected_id
            );
            return Err(mismatch);
        }

        let name = window.read(offsets.name, NAME_LEN).map_err(|e| {
            debug!("Verification failed: name unreadable: {}", e);
            Error::CalibrationFailed(CalibrationFailure::VerificationMismatch)
        })?;
        if !reference.expected_name.matches(&name) {
            debug!(
                "Verification failed: name {:?} != {:?}",
                String::from_utf8_lossy(&name),
                reference.expected_name.to_string()
            );
            return Err(mismatch);
        }

        let node = window.address_of(offsets.link);
        let back_link = window
            .read_ptr(offsets.link)
            .and_then(|forward| self.accessor.handle(forward))
            .and_then(|next| {
                self.accessor
                    .window(next, LINK_NODE_SIZE)
                    .read_ptr(POINTER_WIDTH)
            })
            .map_err(|e| {
                debug!("Verification failed: link unreadable: {}", e);
                Error::CalibrationFailed(CalibrationFailure::VerificationMismatch)
            })?;
        if back_link != node {
            debug!(
                "Verification failed: back-link {:#x} != node {:#x}",
                back_link, node
            );
            return Err(mismatch);
        }

        Ok(())
    }

    /// Calibrate, degrading to the fallback profile on any failure.
    ///
    /// `None` means the reference descriptor could not be resolved.
    pub fn calibrate_or_fallback(&self, reference: Option<&ReferenceDescriptor>) -> Calibration {
        let outcome = match reference {
            Some(reference) => self.calibrate(reference),
            None => Err(Error::CalibrationFailed(CalibrationFailure::SymbolUnresolved)),
        };

        match outcome {
            Ok(offsets) => {
                info!(
                    "Calibrated layout: identifier={:#x} name={:#x} link={:#x}",
                    offsets.identifier, offsets.name, offsets.link
                );
                Calibration {
                    offsets,
                    confidence: Confidence::Verified,
                }
            }
            Err(e) => {
                let reason = match e {
                    Error::CalibrationFailed(reason) => reason,
                    _ => CalibrationFailure::MemoryUnavailable,
                };
                warn!(
                    "{}. Falling back to profile {}",
                    Error::CalibrationFailed(reason),
                    self.fallback_name
                );
                Calibration {
                    offsets: self.fallback,
                    confidence: Confidence::Fallback {
                        profile: self.fallback_name.clone(),
                        reason,
                    },
                }
            }
        }
    }
}

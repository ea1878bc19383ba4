//! Calibrate command implementation.
//!
//! Runs the layout calibrator against a descriptor captured in a raw dump
//! and reports the discovered offsets, or the fallback used instead.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use owo_colors::OwoColorize;
use pidscope_core::{
    Calibration, Calibrator, Confidence, MemoryAccessor, PidscopeConfig, ReferenceDescriptor,
};
use tracing::warn;

use super::hex_utils::{format_hex_address, parse_hex_address};
use crate::dump_image::DumpImage;

/// Calibrate against the reference descriptor at `reference` inside `image`
pub fn calibrate_image(
    config: &PidscopeConfig,
    image: DumpImage,
    reference: u64,
) -> Calibration {
    let accessor = MemoryAccessor::new(Arc::new(image), config.scan.kernel_marker);
    let descriptor = accessor
        .handle(reference)
        .and_then(|base| {
            ReferenceDescriptor::new(
                config.reference.expected_id,
                &config.reference.expected_name,
                base,
            )
        })
        .map_err(|e| warn!("Unusable reference {}: {}", format_hex_address(reference), e))
        .ok();

    let (fallback_name, fallback_offsets) = config.fallback();
    Calibrator::with_fallback(&accessor, config.scan.window, &fallback_name, fallback_offsets)
        .calibrate_or_fallback(descriptor.as_ref())
}

/// Run the calibrate command
pub fn run(
    config: &PidscopeConfig,
    dump: &Path,
    base: &str,
    reference: Option<&str>,
    json: bool,
) -> Result<()> {
    let image = DumpImage::open(dump, parse_hex_address(base)?)?;
    let reference = match reference {
        Some(reference) => parse_hex_address(reference)?,
        None => image.base(),
    };

    let calibration = calibrate_image(config, image, reference);

    if json {
        println!("{}", serde_json::to_string_pretty(&calibration)?);
        return Ok(());
    }

    println!(
        "Reference: {} (id={}, name={:?})",
        format_hex_address(reference),
        config.reference.expected_id,
        config.reference.expected_name
    );
    println!();
    println!("  identifier: 0x{:X}", calibration.offsets.identifier);
    println!("  name:       0x{:X}", calibration.offsets.name);
    println!("  link:       0x{:X}", calibration.offsets.link);
    println!();
    match &calibration.confidence {
        Confidence::Verified => println!("Confidence: {}", "verified".green()),
        Confidence::Fallback { profile, reason } => println!(
            "Confidence: {} (profile {}, {})",
            "fallback".yellow(),
            profile,
            reason
        ),
    }

    Ok(())
}

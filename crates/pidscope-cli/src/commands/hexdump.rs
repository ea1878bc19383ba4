//! Hexdump command implementation.
//!
//! Displays raw dump bytes in traditional hexdump format, useful for
//! checking descriptor fields by hand against a calibration result.
//!
//! # Output Format
//!
//! ```text
//! 0x000: 69 6E 69 74 00 00 00 00  00 00 00 00 00 00 00 00  |init............|
//! ```

use std::path::Path;

use anyhow::Result;
use pidscope_core::RawMemory;

use super::hex_utils::{hexdump_lines, parse_hex_address};
use crate::dump_image::DumpImage;

/// Run the hexdump command
pub fn run(dump: &Path, base: &str, address: Option<&str>, size: usize, ascii: bool) -> Result<()> {
    let image = DumpImage::open(dump, parse_hex_address(base)?)?;
    let address = match address {
        Some(address) => parse_hex_address(address)?,
        None => image.base(),
    };

    let bytes = image.read_bytes(address, size)?;

    println!("Hexdump at 0x{:X} ({} bytes):", address, size);
    println!();
    for line in hexdump_lines(&bytes, ascii) {
        println!("{}", line);
    }

    Ok(())
}

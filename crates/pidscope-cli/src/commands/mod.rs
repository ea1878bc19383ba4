//! CLI command implementations.

pub mod calibrate;
pub mod hex_utils;
pub mod hexdump;
pub mod simulate;

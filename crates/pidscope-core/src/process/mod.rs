mod result;
mod walker;

pub use result::*;
pub use walker::*;

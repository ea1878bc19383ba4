mod calibrator;
mod collection;
mod matcher;
mod signature;

pub use calibrator::*;
pub use collection::*;
pub use matcher::*;
pub use signature::*;

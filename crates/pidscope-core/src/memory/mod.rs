mod accessor;
pub mod layout;

pub use accessor::{KernelPtr, MemoryAccessor, Window};

//! Host capability interfaces
//!
//! Everything pidscope needs from the running system goes through three
//! capabilities injected once at load time:
//! - [`SymbolResolver`]: symbol name to address
//! - [`RawMemory`]: raw byte access to the host address space
//! - [`CallInterceptor`]: after-observers on named entry points

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

#[cfg(any(test, feature = "simulator"))]
pub mod sim;

/// Resolves host symbols to addresses.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// Raw access to host memory.
///
/// Implementations report rejected accesses as [`crate::Error::Unmapped`]
/// and must never fault the host.
pub trait RawMemory: Send + Sync {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()>;
}

/// Opaque registration handle returned by [`CallInterceptor::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

/// State of an intercepted call just before it returns to its caller.
pub struct CallFrame<'a> {
    /// Descriptor address of the calling process
    pub caller: u64,
    /// Value the intercepted call is about to return
    pub return_value: i64,
    /// Buffer about to be copied back to the caller (empty if none)
    pub output: &'a mut [u8],
}

/// Observer run after an intercepted entry point completes.
pub trait CallObserver: Send + Sync {
    fn after_call(&self, frame: &mut CallFrame<'_>);
}

/// Installs and removes observers on named host entry points.
pub trait CallInterceptor: Send + Sync {
    fn attach(&self, entry: &str, observer: Arc<dyn CallObserver>) -> Result<HookId>;

    fn detach(&self, hook: HookId) -> Result<()>;
}

/// The capabilities handed to the load entry point.
#[derive(Clone)]
pub struct HostServices {
    pub symbols: Arc<dyn SymbolResolver>,
    pub memory: Arc<dyn RawMemory>,
    pub interceptor: Arc<dyn CallInterceptor>,
}

impl HostServices {
    pub fn new(
        symbols: Arc<dyn SymbolResolver>,
        memory: Arc<dyn RawMemory>,
        interceptor: Arc<dyn CallInterceptor>,
    ) -> Self {
        Self {
            symbols,
            memory,
            interceptor,
        }
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}

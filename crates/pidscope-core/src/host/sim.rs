//! In-process simulated host
//!
//! Provides all three host capabilities over a sparse map of byte regions,
//! with synthetic process descriptors laid out at chosen offsets. Used by the
//! unit tests and by the `pidscope simulate` command.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::config::PidscopeConfig;
use crate::error::{Error, Result};
use crate::host::{
    CallFrame, CallInterceptor, CallObserver, HookId, HostServices, RawMemory, SymbolResolver,
};
use crate::memory::MemoryAccessor;
use crate::memory::layout::{POINTER_WIDTH, scan::KERNEL_ADDRESS_MARKER};
use crate::offset::{LayoutOffsets, encode_name};

const DESCRIPTOR_BASE: u64 = 0xFFFF_FF80_1000_0000;
const DESCRIPTOR_STRIDE: u64 = 0x4000;
const UTS_BASE: u64 = 0xFFFF_FF80_0900_0000;
const UTS_FIELD_LEN: usize = 65;
const UTS_FIELDS: usize = 6;

/// Host memory as a set of disjoint byte regions.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    regions: Arc<RwLock<BTreeMap<u64, Vec<u8>>>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, address: u64, bytes: Vec<u8>) {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, bytes);
    }

    /// Remove the region starting at `address`, returning its bytes
    pub fn unmap(&self, address: u64) -> Option<Vec<u8>> {
        self.regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
    }

    fn locate(regions: &BTreeMap<u64, Vec<u8>>, address: u64, len: usize) -> Option<(u64, usize)> {
        let (&start, bytes) = regions.range(..=address).next_back()?;
        let offset = (address - start) as usize;
        (offset.checked_add(len)? <= bytes.len()).then_some((start, offset))
    }
}

impl RawMemory for SparseMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let (start, offset) = Self::locate(&regions, address, size)
            .ok_or(Error::Unmapped { address, len: size })?;
        Ok(regions[&start][offset..offset + size].to_vec())
    }

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let (start, offset) = Self::locate(&regions, address, bytes.len()).ok_or(
            Error::Unmapped {
                address,
                len: bytes.len(),
            },
        )?;
        if let Some(region) = regions.get_mut(&start) {
            region[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }
}

/// Descriptor layout used by the simulated host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimLayout {
    pub offsets: LayoutOffsets,
    pub descriptor_size: usize,
}

impl Default for SimLayout {
    fn default() -> Self {
        Self {
            offsets: LayoutOffsets {
                identifier: 0x2F4,
                name: 0x5A8,
                link: 0x1E0,
            },
            descriptor_size: 0x2000,
        }
    }
}

struct Hook {
    id: HookId,
    entry: String,
    observer: Arc<dyn CallObserver>,
}

/// A synthetic host with a live process list, a published text field and
/// two interceptable entry points.
pub struct SimulatedHost {
    layout: SimLayout,
    config: PidscopeConfig,
    memory: SparseMemory,
    symbols: RwLock<HashMap<String, u64>>,
    tasks: Mutex<Vec<(u32, u64)>>,
    next_slot: AtomicU64,
    hooks: Mutex<Vec<Hook>>,
    next_hook: AtomicU64,
    refused: Mutex<HashSet<String>>,
}

impl SimulatedHost {
    pub fn new(layout: SimLayout) -> Self {
        Self::with_config(layout, PidscopeConfig::default())
    }

    /// Build a host whose symbols and entry points follow `config`
    pub fn with_config(layout: SimLayout, config: PidscopeConfig) -> Self {
        let host = Self {
            layout,
            config,
            memory: SparseMemory::new(),
            symbols: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            next_slot: AtomicU64::new(0),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            refused: Mutex::new(HashSet::new()),
        };
        host.map_uts("#1 SMP PREEMPT Mon Oct 19 09:00:00 UTC 2026");
        host
    }

    pub fn layout(&self) -> &SimLayout {
        &self.layout
    }

    pub fn memory(&self) -> &SparseMemory {
        &self.memory
    }

    pub fn accessor(&self) -> MemoryAccessor {
        MemoryAccessor::new(Arc::new(self.memory.clone()), KERNEL_ADDRESS_MARKER)
    }

    pub fn services(self: &Arc<Self>) -> HostServices {
        HostServices::new(self.clone(), self.clone(), self.clone())
    }

    pub fn define_symbol(&self, name: &str, address: u64) {
        self.symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), address);
    }

    pub fn remove_symbol(&self, name: &str) {
        self.symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn map_uts(&self, version: &str) {
        let name_start = self.config.channel.field_offset - self.config.intercept.output_field_offset;
        let mut region = vec![0u8; name_start + UTS_FIELD_LEN * UTS_FIELDS];
        let fields = ["Linux", "localhost", "5.10.198-android12-9", version, "aarch64"];
        for (i, field) in fields.iter().enumerate() {
            let start = name_start + i * UTS_FIELD_LEN;
            let len = field.len().min(UTS_FIELD_LEN - 1);
            region[start..start + len].copy_from_slice(&field.as_bytes()[..len]);
        }
        self.memory.map(UTS_BASE, region);
        self.define_symbol(&self.config.channel.symbol, UTS_BASE);
    }

    /// Start of the mapped region holding the published field
    pub fn uts_address(&self) -> u64 {
        UTS_BASE
    }

    /// Address of the published field in host memory
    pub fn channel_address(&self) -> u64 {
        UTS_BASE + self.config.channel.field_offset as u64
    }

    /// Current content of the published field
    pub fn channel_text(&self) -> String {
        self.memory
            .read_bytes(self.channel_address(), self.config.channel.capacity)
            .map(|bytes| text_of(&bytes))
            .unwrap_or_default()
    }

    /// Descriptor of the first process spawned (the reference and anchor)
    pub fn anchor(&self) -> u64 {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .map(|&(_, addr)| addr)
            .unwrap_or(0)
    }

    pub fn descriptor(&self, pid: u32) -> Option<u64> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|&&(p, _)| p == pid)
            .map(|&(_, addr)| addr)
    }

    fn node(&self, descriptor: u64) -> u64 {
        descriptor + self.layout.offsets.link as u64
    }

    fn write_ptr(&self, address: u64, value: u64) {
        let _ = self.memory.write_bytes(address, &value.to_le_bytes());
    }

    fn read_ptr(&self, address: u64) -> u64 {
        self.memory
            .read_bytes(address, POINTER_WIDTH)
            .map(|b| {
                let mut raw = [0u8; POINTER_WIDTH];
                raw.copy_from_slice(&b);
                u64::from_le_bytes(raw)
            })
            .unwrap_or(0)
    }

    /// Create a descriptor and append it to the process list.
    ///
    /// The first process spawned becomes the reference descriptor.
    pub fn spawn(&self, name: &str, pid: u32) -> u64 {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let address = DESCRIPTOR_BASE + slot * DESCRIPTOR_STRIDE;
        let offsets = self.layout.offsets;

        let mut descriptor = vec![0u8; self.layout.descriptor_size];
        descriptor[offsets.identifier..offsets.identifier + 4].copy_from_slice(&pid.to_le_bytes());
        descriptor[offsets.name..offsets.name + 16].copy_from_slice(&encode_name(name));
        self.memory.map(address, descriptor);

        let node = self.node(address);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.first() {
            None => {
                self.write_ptr(node, node);
                self.write_ptr(node + POINTER_WIDTH as u64, node);
                self.define_symbol(&self.config.reference.symbol, address);
            }
            Some(&(_, head)) => {
                let head = self.node(head);
                let tail = self.read_ptr(head + POINTER_WIDTH as u64);
                self.write_ptr(node, head);
                self.write_ptr(node + POINTER_WIDTH as u64, tail);
                self.write_ptr(tail, node);
                self.write_ptr(head + POINTER_WIDTH as u64, node);
            }
        }
        tasks.push((pid, address));
        debug!("Spawned {:?} (pid={}) at {:#x}", name, pid, address);
        address
    }

    /// Unlink and free a descriptor. The reference descriptor never exits.
    pub fn exit(&self, pid: u32) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = tasks.iter().position(|&(p, _)| p == pid) else {
            return;
        };
        if index == 0 {
            return;
        }
        let (_, address) = tasks.remove(index);
        let node = self.node(address);
        let next = self.read_ptr(node);
        let prev = self.read_ptr(node + POINTER_WIDTH as u64);
        self.write_ptr(prev, next);
        self.write_ptr(next + POINTER_WIDTH as u64, prev);
        let _ = self.memory.unmap(address);
    }

    pub fn rename(&self, pid: u32, name: &str) {
        if let Some(address) = self.descriptor(pid) {
            let _ = self
                .memory
                .write_bytes(address + self.layout.offsets.name as u64, &encode_name(name));
        }
    }

    /// Point `from`'s forward link at `to`, corrupting the list
    pub fn relink(&self, from: u32, to: u32) {
        if let (Some(from), Some(to)) = (self.descriptor(from), self.descriptor(to)) {
            self.write_ptr(self.node(from), self.node(to));
        }
    }

    /// Make future attaches to `entry` fail
    pub fn refuse_attach(&self, entry: &str) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.to_string());
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run `entry` and its observers, returning the (possibly rewritten) value
    pub fn invoke(&self, entry: &str, caller: u64, return_value: i64, output: &mut [u8]) -> i64 {
        let observers: Vec<Arc<dyn CallObserver>> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|hook| hook.entry == entry)
            .map(|hook| hook.observer.clone())
            .collect();

        let mut frame = CallFrame {
            caller,
            return_value,
            output,
        };
        for observer in observers {
            observer.after_call(&mut frame);
        }
        frame.return_value
    }

    /// The identifier query, issued by process `pid`
    pub fn getpid(&self, pid: u32) -> i64 {
        let caller = self.descriptor(pid).unwrap_or(0);
        let entry = self.config.intercept.query_entry.clone();
        self.invoke(&entry, caller, pid as i64, &mut [])
    }

    /// The version field as a caller of the publish-read entry sees it
    pub fn uname_version(&self) -> String {
        let field = self.config.intercept.output_field_offset;
        let start = self.channel_address() - field as u64;
        let mut output = self
            .memory
            .read_bytes(start, UTS_FIELD_LEN * UTS_FIELDS)
            .unwrap_or_else(|_| vec![0; UTS_FIELD_LEN * UTS_FIELDS]);

        let entry = self.config.intercept.publish_read_entry.clone();
        self.invoke(&entry, 0, 0, &mut output);
        text_of(&output[field..field + UTS_FIELD_LEN])
    }
}

fn text_of(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl SymbolResolver for SimulatedHost {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }
}

impl RawMemory for SimulatedHost {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.memory.read_bytes(address, size)
    }

    fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<()> {
        self.memory.write_bytes(address, bytes)
    }
}

impl CallInterceptor for SimulatedHost {
    fn attach(&self, entry: &str, observer: Arc<dyn CallObserver>) -> Result<HookId> {
        if self
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entry)
        {
            return Err(Error::InterceptionInstallFailed {
                entry: entry.to_string(),
                reason: "entry point refused".to_string(),
            });
        }

        let id = HookId(self.next_hook.fetch_add(1, Ordering::SeqCst));
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Hook {
                id,
                entry: entry.to_string(),
                observer,
            });
        Ok(id)
    }

    fn detach(&self, hook: HookId) -> Result<()> {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|h| h.id != hook);
        if hooks.len() == before {
            return Err(Error::InvalidState(format!("hook {} not attached", hook.0)));
        }
        Ok(())
    }
}

//! Bounded traversal of the live process list
//!
//! The list is circular and linked through the descriptor's link field. A
//! walk takes no locks: nodes that fail validation or cannot be read end the
//! walk as if the target were absent, and a ceiling on visited nodes
//! guarantees termination on a corrupt list or a wrong link offset.

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::memory::layout::{NAME_LEN, scan::MAX_WALK_NODES};
use crate::memory::{KernelPtr, MemoryAccessor};
use crate::offset::{LayoutOffsets, TargetSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Found(u32),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkReport {
    pub outcome: WalkOutcome,
    /// Descriptors inspected, the anchor included
    pub visited: usize,
}

pub struct ProcessListWalker<'a> {
    accessor: &'a MemoryAccessor,
    offsets: LayoutOffsets,
    max_nodes: usize,
}

impl<'a> ProcessListWalker<'a> {
    pub fn new(accessor: &'a MemoryAccessor, offsets: LayoutOffsets) -> Self {
        Self {
            accessor,
            offsets,
            max_nodes: MAX_WALK_NODES,
        }
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes.max(1);
        self
    }

    /// Walk the list starting at the `anchor` descriptor looking for `signature`.
    pub fn find_by_name(
        &self,
        anchor: KernelPtr,
        signature: &TargetSignature,
    ) -> Result<WalkReport> {
        let anchor_node = anchor.addr().wrapping_add(self.offsets.link as u64);
        let mut descriptor = anchor;
        let mut visited = 0;

        loop {
            if visited >= self.max_nodes {
                warn!(
                    "Process list walk from {} exceeded {} nodes",
                    anchor, self.max_nodes
                );
                return Err(Error::WalkLimitExceeded {
                    limit: self.max_nodes,
                });
            }
            visited += 1;

            match self.inspect(descriptor, signature) {
                Ok(Some(id)) => {
                    debug!(
                        "Found {:?} at {} (id={}, visited={})",
                        signature.to_string(),
                        descriptor,
                        id,
                        visited
                    );
                    return Ok(WalkReport {
                        outcome: WalkOutcome::Found(id),
                        visited,
                    });
                }
                Ok(None) => {}
                Err(e) => return self.stale(descriptor, visited, e),
            }

            let next_node = match self.next_node(descriptor) {
                Ok(node) => node,
                Err(e) => return self.stale(descriptor, visited, e),
            };

            if next_node.addr() == anchor_node {
                debug!(
                    "{:?} not in process list ({} nodes)",
                    signature.to_string(),
                    visited
                );
                return Ok(WalkReport {
                    outcome: WalkOutcome::NotFound,
                    visited,
                });
            }

            descriptor = match self.descriptor_of(next_node) {
                Ok(d) => d,
                Err(e) => return self.stale(next_node, visited, e),
            };
        }
    }

    /// Identifier of `descriptor` if its name matches `signature`
    pub fn inspect(
        &self,
        descriptor: KernelPtr,
        signature: &TargetSignature,
    ) -> Result<Option<u32>> {
        let window = self.accessor.window(descriptor, self.offsets.span());
        let name = window.read(self.offsets.name, NAME_LEN)?;
        trace!(
            "  {}: {:?}",
            descriptor,
            String::from_utf8_lossy(crate::offset::name_field(&name))
        );

        if !signature.matches(&name) {
            return Ok(None);
        }
        window.read_u32(self.offsets.identifier).map(Some)
    }

    fn next_node(&self, descriptor: KernelPtr) -> Result<KernelPtr> {
        let forward = self
            .accessor
            .window(descriptor, self.offsets.span())
            .read_ptr(self.offsets.link)?;
        self.accessor.handle(forward)
    }

    fn descriptor_of(&self, node: KernelPtr) -> Result<KernelPtr> {
        let base = node
            .addr()
            .checked_sub(self.offsets.link as u64)
            .ok_or(Error::NotKernelAddress(node.addr()))?;
        self.accessor.handle(base)
    }

    /// A memory fault ends the walk as `NotFound`; any other host error is returned
    fn stale(&self, at: KernelPtr, visited: usize, e: Error) -> Result<WalkReport> {
        if !e.is_memory_fault() {
            return Err(e);
        }
        warn!(
            "Process list walk stopped at {} after {} nodes: {}",
            at, visited, e
        );
        Ok(WalkReport {
            outcome: WalkOutcome::NotFound,
            visited,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::host::RawMemory;
    use crate::host::sim::{SimLayout, SimulatedHost};
    use crate::memory::layout::scan::KERNEL_ADDRESS_MARKER;

    fn signature(name: &str) -> TargetSignature {
        TargetSignature::parse(name).unwrap()
    }

    fn host_with(names: &[(&str, u32)]) -> SimulatedHost {
        let host = SimulatedHost::new(SimLayout::default());
        for (name, pid) in names {
            host.spawn(name, *pid);
        }
        host
    }

    #[test]
    fn test_finds_single_match() {
        let host = host_with(&[
            ("init", 1),
            ("kthreadd", 2),
            ("worker", 100),
            ("worker-proc", 4242),
            ("worker-proc2", 4243),
        ]);
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, host.layout().offsets);
        let anchor = accessor.handle(host.anchor()).unwrap();

        let report = walker.find_by_name(anchor, &signature("worker-proc")).unwrap();
        assert_eq!(report.outcome, WalkOutcome::Found(4242));
        assert_eq!(report.visited, 4);
    }

    #[test]
    fn test_anchor_itself_can_match() {
        let host = host_with(&[("init", 1), ("kthreadd", 2)]);
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, host.layout().offsets);
        let anchor = accessor.handle(host.anchor()).unwrap();

        let report = walker.find_by_name(anchor, &signature("init")).unwrap();
        assert_eq!(report.outcome, WalkOutcome::Found(1));
        assert_eq!(report.visited, 1);
    }

    #[test]
    fn test_not_found_stops_at_anchor() {
        let names: Vec<(String, u32)> = (0..12).map(|i| (format!("proc-{}", i), 10 + i)).collect();
        let host = SimulatedHost::new(SimLayout::default());
        for (name, pid) in &names {
            host.spawn(name, *pid);
        }
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, host.layout().offsets).with_max_nodes(100);
        let anchor = accessor.handle(host.anchor()).unwrap();

        let report = walker.find_by_name(anchor, &signature("worker-proc")).unwrap();
        assert_eq!(report.outcome, WalkOutcome::NotFound);
        assert_eq!(report.visited, 12);
    }

    #[test]
    fn test_exited_process_not_found() {
        let host = host_with(&[("init", 1), ("worker-proc", 4242), ("logd", 300)]);
        host.exit(4242);
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, host.layout().offsets);
        let anchor = accessor.handle(host.anchor()).unwrap();

        let report = walker.find_by_name(anchor, &signature("worker-proc")).unwrap();
        assert_eq!(report.outcome, WalkOutcome::NotFound);
        assert_eq!(report.visited, 2);
    }

    #[test]
    fn test_corrupt_cycle_hits_ceiling() {
        let host = host_with(&[("init", 1), ("a", 2), ("b", 3), ("c", 4)]);
        // c -> a, so the walk never returns to init
        host.relink(4, 2);
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, host.layout().offsets).with_max_nodes(50);
        let anchor = accessor.handle(host.anchor()).unwrap();

        assert!(matches!(
            walker.find_by_name(anchor, &signature("worker-proc")),
            Err(Error::WalkLimitExceeded { limit: 50 })
        ));
    }

    #[test]
    fn test_wrong_link_offset_terminates() {
        let host = host_with(&[("init", 1), ("a", 2), ("b", 3)]);
        let mut offsets = host.layout().offsets;
        offsets.link += 0x40;
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, offsets);
        let anchor = accessor.handle(host.anchor()).unwrap();

        let report = walker.find_by_name(anchor, &signature("b")).unwrap();
        assert_eq!(report.outcome, WalkOutcome::NotFound);
        assert_eq!(report.visited, 1);
    }

    #[test]
    fn test_host_error_is_not_a_stale_node() {
        struct FailingMemory;
        impl RawMemory for FailingMemory {
            fn read_bytes(&self, _address: u64, _size: usize) -> Result<Vec<u8>> {
                Err(Error::Io(std::io::Error::other("bus error")))
            }
            fn write_bytes(&self, _address: u64, _bytes: &[u8]) -> Result<()> {
                Err(Error::Io(std::io::Error::other("bus error")))
            }
        }

        let accessor = MemoryAccessor::new(Arc::new(FailingMemory), KERNEL_ADDRESS_MARKER);
        let walker = ProcessListWalker::new(&accessor, SimLayout::default().offsets);
        let anchor = accessor.handle(0xFFFF_FF80_1000_0000).unwrap();

        assert!(matches!(
            walker.find_by_name(anchor, &signature("init")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_inspect_reads_identifier_only_on_match() {
        let host = host_with(&[("init", 1), ("worker-proc", 4242)]);
        let accessor = host.accessor();
        let walker = ProcessListWalker::new(&accessor, host.layout().offsets);
        let descriptor = accessor.handle(host.descriptor(4242).unwrap()).unwrap();

        assert_eq!(
            walker.inspect(descriptor, &signature("worker-proc")).unwrap(),
            Some(4242)
        );
        assert_eq!(walker.inspect(descriptor, &signature("worker")).unwrap(), None);
    }
}

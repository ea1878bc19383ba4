//! Load-to-unload lifecycle of one target search
//!
//! [`PidFinder`] is the module-lifetime context: it owns the calibrated
//! layout, the result slot, the published channel and the interception
//! hooks. Periodic refresh is left to the embedder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::channel::ResultChannel;
use crate::config::PidscopeConfig;
use crate::error::{Error, Result};
use crate::host::HostServices;
use crate::intercept::{InterceptionController, PublishReadObserver, QueryObserver};
use crate::memory::{KernelPtr, MemoryAccessor};
use crate::offset::{Calibration, Calibrator, ReferenceDescriptor, TargetSignature};
use crate::process::{
    DiscoveredResult, DiscoveryStatus, ProcessListWalker, StatusError, WalkOutcome,
};

pub struct PidFinder {
    accessor: MemoryAccessor,
    calibration: Calibration,
    signature: TargetSignature,
    /// Reference descriptor the walk starts from; `None` if it did not resolve
    anchor: Option<KernelPtr>,
    max_walk_nodes: usize,
    slot: Arc<DiscoveredResult>,
    channel: Arc<ResultChannel>,
    controller: InterceptionController,
    unloaded: AtomicBool,
}

impl PidFinder {
    /// Calibrate, publish the first result and install interception.
    ///
    /// `args` is the raw load argument; blank selects the configured default
    /// target. Fails only when the target is invalid, the channel cannot be
    /// located or written, or interception cannot be installed.
    pub fn load(services: HostServices, config: PidscopeConfig, args: &str) -> Result<Self> {
        let signature = TargetSignature::from_args(args, &config.target.default_name)?;
        let accessor = MemoryAccessor::new(services.memory.clone(), config.scan.kernel_marker);

        let channel_base = services
            .symbols
            .resolve(&config.channel.symbol)
            .ok_or_else(|| Error::SymbolUnresolved(config.channel.symbol.clone()))?;
        let channel_address = accessor.handle(channel_base)?;
        let channel_address = accessor.offset_handle(channel_address, config.channel.field_offset)?;
        let channel = Arc::new(ResultChannel::new(
            accessor.clone(),
            channel_address,
            config.channel.capacity,
            format!("{}[{}]", config.channel.label, signature),
        ));
        debug!("Channel at {} ({} bytes)", channel_address, channel.capacity());

        let anchor = Self::resolve_reference(&services, &config, &accessor);
        let (fallback_name, fallback_offsets) = config.fallback();
        let calibration = Calibrator::with_fallback(
            &accessor,
            config.scan.window,
            &fallback_name,
            fallback_offsets,
        )
        .calibrate_or_fallback(anchor.as_ref());

        let slot = Arc::new(DiscoveredResult::new());
        let controller =
            InterceptionController::new(services.interceptor.clone(), config.intercept.clone());

        let finder = Self {
            accessor,
            calibration,
            signature,
            anchor: anchor.map(|reference| reference.base),
            max_walk_nodes: config.scan.max_walk_nodes,
            slot,
            channel,
            controller,
            unloaded: AtomicBool::new(false),
        };

        // the first publish also captures the backup; an unusable channel refuses the load
        let initial = finder.walk();
        finder.slot.store(initial);
        if let Err(e) = finder.channel.publish(initial) {
            warn!("Channel at {} unusable: {}", channel_address, e);
            finder.unload();
            return Err(e);
        }
        info!("Searching for {}: {}", finder.signature, initial);

        let query = QueryObserver::new(
            finder.accessor.clone(),
            finder.calibration.offsets,
            finder.signature,
            finder.slot.clone(),
        );
        let publish_read = PublishReadObserver::new(
            finder.channel.clone(),
            finder.slot.clone(),
            config.intercept.output_field_offset,
        );
        if let Err(e) = finder
            .controller
            .install(Arc::new(query), Arc::new(publish_read))
        {
            warn!("Load aborted: {}", e);
            finder.unload();
            return Err(e);
        }

        Ok(finder)
    }

    fn resolve_reference(
        services: &HostServices,
        config: &PidscopeConfig,
        accessor: &MemoryAccessor,
    ) -> Option<ReferenceDescriptor> {
        let reference = &config.reference;
        let Some(address) = services.symbols.resolve(&reference.symbol) else {
            warn!("Reference symbol {} not resolved", reference.symbol);
            return None;
        };
        let base = accessor
            .handle(address)
            .map_err(|e| warn!("Reference {}: {}", reference.symbol, e))
            .ok()?;
        ReferenceDescriptor::new(reference.expected_id, &reference.expected_name, base)
            .map_err(|e| warn!("Reference {}: {}", reference.symbol, e))
            .ok()
    }

    /// Walk the process list once and publish the outcome.
    pub fn refresh(&self) -> DiscoveryStatus {
        let status = self.walk();
        self.slot.store(status);
        if self.unloaded.load(Ordering::Acquire) {
            return status;
        }
        if let Err(e) = self.channel.publish(status) {
            warn!("Publish of {} failed: {}", status, e);
        }
        status
    }

    fn walk(&self) -> DiscoveryStatus {
        let Some(anchor) = self.anchor else {
            return DiscoveryStatus::Error(StatusError::NoAnchor);
        };
        let walker = ProcessListWalker::new(&self.accessor, self.calibration.offsets)
            .with_max_nodes(self.max_walk_nodes);
        match walker.find_by_name(anchor, &self.signature) {
            Ok(report) => match report.outcome {
                WalkOutcome::Found(id) => DiscoveryStatus::Found(id),
                WalkOutcome::NotFound => DiscoveryStatus::NotYetRunning,
            },
            Err(Error::WalkLimitExceeded { .. }) => DiscoveryStatus::Error(StatusError::WalkLimit),
            Err(e) => {
                warn!("Walk failed: {}", e);
                DiscoveryStatus::Error(StatusError::MemoryFault)
            }
        }
    }

    /// Fresh lookup rendered as a decimal line, `-1` when the target is absent
    pub fn read_status(&self) -> String {
        match self.walk() {
            DiscoveryStatus::Found(id) => format!("{}\n", id),
            _ => "-1\n".to_string(),
        }
    }

    /// Detach interception and restore the channel. Safe to call repeatedly.
    ///
    /// A later call retries a channel restore that failed.
    pub fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.channel.restore() {
                warn!("Channel restore failed again: {}", e);
            }
            return;
        }
        self.controller.uninstall(&self.channel);
        info!("Unloaded search for {}", self.signature);
    }

    pub fn is_loaded(&self) -> bool {
        !self.unloaded.load(Ordering::Acquire)
    }

    /// Last recorded status, from a walk or an intercepted query
    pub fn status(&self) -> DiscoveryStatus {
        self.slot.load()
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn target(&self) -> &TargetSignature {
        &self.signature
    }

    pub fn channel(&self) -> &ResultChannel {
        &self.channel
    }
}

impl Drop for PidFinder {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Load entry point: `0` and the finder on success, a negative status otherwise
pub fn load_entry(
    services: HostServices,
    config: PidscopeConfig,
    args: &str,
) -> (i64, Option<PidFinder>) {
    match PidFinder::load(services, config, args) {
        Ok(finder) => (0, Some(finder)),
        Err(e) => {
            warn!("Load failed: {}", e);
            (e.status_code(), None)
        }
    }
}

/// Unload entry point. Always succeeds.
pub fn unload_entry(finder: &PidFinder) -> i64 {
    finder.unload();
    0
}

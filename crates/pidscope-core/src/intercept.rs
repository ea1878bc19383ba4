//! Interception of the identifier query and the publish-read entry points
//!
//! Two observers are attached while pidscope is loaded:
//! - [`QueryObserver`] runs after every identifier query and records the
//!   caller's identifier when the caller is the target.
//! - [`PublishReadObserver`] runs after every read of the published field
//!   and splices the current result into the caller's copy.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, trace, warn};

use crate::channel::ResultChannel;
use crate::config::InterceptConfig;
use crate::error::{Error, Result};
use crate::host::{CallFrame, CallInterceptor, CallObserver, HookId};
use crate::memory::MemoryAccessor;
use crate::memory::layout::NAME_LEN;
use crate::offset::{LayoutOffsets, TargetSignature};
use crate::process::{DiscoveredResult, DiscoveryStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Uninstalled,
    Installing,
    Installed,
    Uninstalling,
}

#[derive(Debug)]
struct ControllerState {
    phase: ControllerPhase,
    query: Option<HookId>,
    publish_read: Option<HookId>,
}

/// Owns both hook registrations. Every transition runs under one lock.
pub struct InterceptionController {
    interceptor: Arc<dyn CallInterceptor>,
    config: InterceptConfig,
    state: Mutex<ControllerState>,
}

impl InterceptionController {
    pub fn new(interceptor: Arc<dyn CallInterceptor>, config: InterceptConfig) -> Self {
        Self {
            interceptor,
            config,
            state: Mutex::new(ControllerState {
                phase: ControllerPhase::Uninstalled,
                query: None,
                publish_read: None,
            }),
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).phase
    }

    /// Attach both observers, or neither.
    pub fn install(
        &self,
        query: Arc<dyn CallObserver>,
        publish_read: Arc<dyn CallObserver>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.phase != ControllerPhase::Uninstalled {
            return Err(Error::InvalidState(format!(
                "cannot install while {:?}",
                state.phase
            )));
        }
        state.phase = ControllerPhase::Installing;

        let query_hook = match self.interceptor.attach(&self.config.query_entry, query) {
            Ok(hook) => hook,
            Err(e) => {
                state.phase = ControllerPhase::Uninstalled;
                return Err(install_error(&self.config.query_entry, e));
            }
        };
        debug!("Attached to {} ({:?})", self.config.query_entry, query_hook);

        let read_hook = match self
            .interceptor
            .attach(&self.config.publish_read_entry, publish_read)
        {
            Ok(hook) => hook,
            Err(e) => {
                if let Err(detach_err) = self.interceptor.detach(query_hook) {
                    warn!(
                        "Rollback of {} failed: {}",
                        self.config.query_entry, detach_err
                    );
                }
                state.phase = ControllerPhase::Uninstalled;
                return Err(install_error(&self.config.publish_read_entry, e));
            }
        };
        debug!(
            "Attached to {} ({:?})",
            self.config.publish_read_entry, read_hook
        );

        state.query = Some(query_hook);
        state.publish_read = Some(read_hook);
        state.phase = ControllerPhase::Installed;
        info!(
            "Interception installed on {} and {}",
            self.config.query_entry, self.config.publish_read_entry
        );
        Ok(())
    }

    /// Detach whatever is attached, then restore the channel.
    ///
    /// Never fails; detach and restore errors are logged.
    pub fn uninstall(&self, channel: &ResultChannel) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.phase = ControllerPhase::Uninstalling;

        // readers first, so nothing splices a value that is about to vanish
        if let Some(hook) = state.publish_read.take() {
            if let Err(e) = self.interceptor.detach(hook) {
                warn!("Detach from {} failed: {}", self.config.publish_read_entry, e);
            }
        }
        if let Some(hook) = state.query.take() {
            if let Err(e) = self.interceptor.detach(hook) {
                warn!("Detach from {} failed: {}", self.config.query_entry, e);
            }
        }
        if let Err(e) = channel.restore() {
            warn!("Channel restore failed: {}", e);
        }

        state.phase = ControllerPhase::Uninstalled;
        debug!("Interception uninstalled");
    }
}

fn install_error(entry: &str, e: Error) -> Error {
    match e {
        Error::InterceptionInstallFailed { .. } => e,
        other => Error::InterceptionInstallFailed {
            entry: entry.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Records the caller's identifier when the caller is the target.
pub struct QueryObserver {
    accessor: MemoryAccessor,
    offsets: LayoutOffsets,
    signature: TargetSignature,
    slot: Arc<DiscoveredResult>,
}

impl QueryObserver {
    pub fn new(
        accessor: MemoryAccessor,
        offsets: LayoutOffsets,
        signature: TargetSignature,
        slot: Arc<DiscoveredResult>,
    ) -> Self {
        Self {
            accessor,
            offsets,
            signature,
            slot,
        }
    }

    fn caller_matches(&self, caller: u64) -> bool {
        let Ok(descriptor) = self.accessor.handle(caller) else {
            return false;
        };
        match self
            .accessor
            .window(descriptor, self.offsets.span())
            .read(self.offsets.name, NAME_LEN)
        {
            Ok(name) => self.signature.matches(&name),
            Err(e) => {
                trace!("Unreadable caller {}: {}", descriptor, e);
                false
            }
        }
    }
}

impl CallObserver for QueryObserver {
    fn after_call(&self, frame: &mut CallFrame<'_>) {
        let Ok(id) = u32::try_from(frame.return_value) else {
            return;
        };
        if id == 0 || !self.caller_matches(frame.caller) {
            return;
        }
        let status = DiscoveryStatus::Found(id);
        if self.slot.swap(status) != status {
            info!("{} reported itself as {}", self.signature, id);
        }
    }
}

/// Splices the current result into every read of the published field.
pub struct PublishReadObserver {
    channel: Arc<ResultChannel>,
    slot: Arc<DiscoveredResult>,
    output_field_offset: usize,
}

impl PublishReadObserver {
    pub fn new(
        channel: Arc<ResultChannel>,
        slot: Arc<DiscoveredResult>,
        output_field_offset: usize,
    ) -> Self {
        Self {
            channel,
            slot,
            output_field_offset,
        }
    }
}

impl CallObserver for PublishReadObserver {
    fn after_call(&self, frame: &mut CallFrame<'_>) {
        if let Err(e) = self.channel.publish_if_changed(self.slot.load()) {
            debug!("Republish skipped: {}", e);
        }
        self.channel.splice(frame.output, self.output_field_offset);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::PidscopeConfig;
    use crate::host::sim::{SimLayout, SimulatedHost};

    struct Fixture {
        host: Arc<SimulatedHost>,
        slot: Arc<DiscoveredResult>,
        channel: Arc<ResultChannel>,
        controller: InterceptionController,
    }

    fn fixture(target: &str) -> Fixture {
        let host = Arc::new(SimulatedHost::new(SimLayout::default()));
        host.spawn("init", 1);
        let config = PidscopeConfig::default();
        let accessor = host.accessor();
        let address = accessor.handle(host.channel_address()).unwrap();
        let channel = Arc::new(ResultChannel::new(
            accessor,
            address,
            config.channel.capacity,
            format!("pid[{}]", target),
        ));
        let controller = InterceptionController::new(host.clone(), config.intercept);
        Fixture {
            host,
            slot: Arc::new(DiscoveredResult::new()),
            channel,
            controller,
        }
    }

    fn observers(f: &Fixture, target: &str) -> (Arc<dyn CallObserver>, Arc<dyn CallObserver>) {
        let query: Arc<dyn CallObserver> = Arc::new(QueryObserver::new(
            f.host.accessor(),
            f.host.layout().offsets,
            TargetSignature::parse(target).unwrap(),
            f.slot.clone(),
        ));
        let read: Arc<dyn CallObserver> = Arc::new(PublishReadObserver::new(
            f.channel.clone(),
            f.slot.clone(),
            PidscopeConfig::default().intercept.output_field_offset,
        ));
        (query, read)
    }

    #[test]
    fn test_install_and_uninstall() {
        let f = fixture("worker-proc");
        let (query, read) = observers(&f, "worker-proc");
        let original = f.host.channel_text();

        f.controller.install(query, read).unwrap();
        assert_eq!(f.controller.phase(), ControllerPhase::Installed);
        assert_eq!(f.host.hook_count(), 2);

        f.channel.publish(f.slot.load()).unwrap();
        assert_eq!(f.host.uname_version(), "pid[worker-proc]=not_found");

        f.controller.uninstall(&f.channel);
        assert_eq!(f.controller.phase(), ControllerPhase::Uninstalled);
        assert_eq!(f.host.hook_count(), 0);
        assert_eq!(f.host.channel_text(), original);
        assert_eq!(f.host.uname_version(), original);
    }

    #[test]
    fn test_second_install_rejected() {
        let f = fixture("init");
        let (query, read) = observers(&f, "init");
        f.controller.install(query.clone(), read.clone()).unwrap();

        assert!(matches!(
            f.controller.install(query, read),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(f.host.hook_count(), 2);
    }

    #[test]
    fn test_failed_second_attach_rolls_back() {
        let f = fixture("init");
        f.host
            .refuse_attach(&PidscopeConfig::default().intercept.publish_read_entry);
        let (query, read) = observers(&f, "init");

        let err = f.controller.install(query, read).unwrap_err();
        assert!(matches!(err, Error::InterceptionInstallFailed { .. }));
        assert_eq!(f.host.hook_count(), 0);
        assert_eq!(f.controller.phase(), ControllerPhase::Uninstalled);

        // uninstall after a partial install is harmless
        let original = f.host.channel_text();
        f.controller.uninstall(&f.channel);
        assert_eq!(f.host.channel_text(), original);
    }

    #[test]
    fn test_query_records_matching_caller_only() {
        let f = fixture("worker-proc");
        f.host.spawn("worker", 100);
        f.host.spawn("worker-proc", 4242);
        let (query, read) = observers(&f, "worker-proc");
        f.controller.install(query, read).unwrap();

        assert_eq!(f.host.getpid(100), 100);
        assert_eq!(f.slot.load(), DiscoveryStatus::NotYetRunning);

        assert_eq!(f.host.getpid(4242), 4242);
        assert_eq!(f.slot.load(), DiscoveryStatus::Found(4242));
        assert_eq!(f.host.uname_version(), "pid[worker-proc]=4242");
    }

    #[test]
    fn test_concurrent_queries_settle_on_match() {
        let f = fixture("worker-proc");
        for i in 0..99 {
            f.host.spawn(&format!("proc-{}", i), 1000 + i);
        }
        f.host.spawn("worker-proc", 4242);
        let (query, read) = observers(&f, "worker-proc");
        f.controller.install(query, read).unwrap();

        let pids: Vec<u32> = (0..99).map(|i| 1000 + i).chain([4242]).collect();
        thread::scope(|scope| {
            for pid in &pids {
                let host = &f.host;
                scope.spawn(move || host.getpid(*pid));
            }
            let slot = &f.slot;
            scope.spawn(move || {
                for _ in 0..1000 {
                    let seen = slot.load();
                    assert!(
                        seen == DiscoveryStatus::NotYetRunning
                            || seen == DiscoveryStatus::Found(4242),
                        "torn or foreign value {seen:?}"
                    );
                }
            });
            let host = &f.host;
            scope.spawn(move || {
                for _ in 0..100 {
                    let text = host.uname_version();
                    assert!(
                        text == "pid[worker-proc]=not_found" || text == "pid[worker-proc]=4242",
                        "unexpected channel text {text:?}"
                    );
                }
            });
        });

        assert_eq!(f.slot.load(), DiscoveryStatus::Found(4242));
        assert_eq!(f.host.uname_version(), "pid[worker-proc]=4242");
    }
}

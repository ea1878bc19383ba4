//! The published result channel
//!
//! A fixed-capacity text field the host normally uses for its build string is
//! repurposed to carry `"<label>=<value>"`. The original content is captured
//! before the first write and written back on teardown.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memory::{KernelPtr, MemoryAccessor};
use crate::process::DiscoveryStatus;

/// Original content of the channel, captured once before the first write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBackup(Vec<u8>);

impl ChannelBackup {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    backup: Option<ChannelBackup>,
    /// Set by `restore`; the channel accepts no further writes
    closed: bool,
    /// Rendering of the last successful publish
    current: Option<(DiscoveryStatus, Vec<u8>)>,
}

pub struct ResultChannel {
    accessor: MemoryAccessor,
    address: KernelPtr,
    capacity: usize,
    label: String,
    state: Mutex<ChannelState>,
}

impl ResultChannel {
    /// `label` is the full text before `=`, e.g. `pid[worker-proc]`
    pub fn new(accessor: MemoryAccessor, address: KernelPtr, capacity: usize, label: String) -> Self {
        Self {
            accessor,
            address,
            capacity: capacity.max(1),
            label,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Render `status` into exactly `capacity` bytes, NUL padded.
    ///
    /// The text is truncated so at least one terminator always remains.
    pub fn render(&self, status: DiscoveryStatus) -> Vec<u8> {
        let text = format!("{}={}", self.label, status.token());
        let mut field = vec![0u8; self.capacity];
        let len = text.len().min(self.capacity - 1);
        field[..len].copy_from_slice(&text.as_bytes()[..len]);
        field
    }

    /// Write `status` into the channel, capturing the backup on first use
    pub fn publish(&self, status: DiscoveryStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Error::InvalidState("channel already restored".to_string()));
        }
        let window = self.accessor.window(self.address, self.capacity);

        if state.backup.is_none() {
            let original = window.read(0, self.capacity)?;
            debug!(
                "Captured channel backup at {}: {:?}",
                self.address,
                String::from_utf8_lossy(trim_nul(&original))
            );
            state.backup = Some(ChannelBackup(original));
        }

        let rendered = self.render(status);
        window.write(0, &rendered)?;
        debug!("Published {:?}", String::from_utf8_lossy(trim_nul(&rendered)));
        state.current = Some((status, rendered));
        Ok(())
    }

    /// Publish only if `status` differs from the last published value
    pub fn publish_if_changed(&self, status: DiscoveryStatus) -> Result<bool> {
        let unchanged = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .as_ref()
            .is_some_and(|(last, _)| *last == status);
        if unchanged {
            return Ok(false);
        }
        self.publish(status)?;
        Ok(true)
    }

    /// Copy the current rendering into an intercepted call's output buffer
    pub fn splice(&self, output: &mut [u8], field_offset: usize) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((_, rendered)) = state.current.as_ref() else {
            return false;
        };
        if state.closed {
            return false;
        }
        let Some(target) = field_offset
            .checked_add(rendered.len())
            .and_then(|end| output.get_mut(field_offset..end))
        else {
            warn!(
                "Output buffer of {} bytes too small for channel at {:#x}",
                output.len(),
                field_offset
            );
            return false;
        };
        target.copy_from_slice(rendered);
        true
    }

    /// Write the backup back and close the channel.
    ///
    /// A failed write keeps the backup so a later call can retry. Once the
    /// backup is written, later calls (and a restore before any publish)
    /// write nothing.
    pub fn restore(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.current = None;
        let Some(backup) = state.backup.take() else {
            return Ok(());
        };

        if let Err(e) = self
            .accessor
            .window(self.address, self.capacity)
            .write(0, backup.as_bytes())
        {
            state.backup = Some(backup);
            return Err(e);
        }
        info!(
            "Restored channel at {} to {:?}",
            self.address,
            String::from_utf8_lossy(trim_nul(backup.as_bytes()))
        );
        Ok(())
    }

    /// The channel's current content up to the first NUL
    pub fn read_text(&self) -> Result<String> {
        let bytes = self
            .accessor
            .window(self.address, self.capacity)
            .read(0, self.capacity)?;
        Ok(String::from_utf8_lossy(trim_nul(&bytes)).into_owned())
    }
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RawMemory;
    use crate::host::sim::{SimLayout, SimulatedHost};
    use crate::process::StatusError;

    fn channel(host: &SimulatedHost, label: &str) -> ResultChannel {
        let accessor = host.accessor();
        let address = accessor.handle(host.channel_address()).unwrap();
        ResultChannel::new(accessor, address, 65, label.to_string())
    }

    #[test]
    fn test_render_formats() {
        let host = SimulatedHost::new(SimLayout::default());
        let channel = channel(&host, "pid[worker-proc]");

        let rendered = channel.render(DiscoveryStatus::Found(4242));
        assert_eq!(rendered.len(), 65);
        assert_eq!(trim_nul(&rendered), b"pid[worker-proc]=4242");
        assert_eq!(
            trim_nul(&channel.render(DiscoveryStatus::NotYetRunning)),
            b"pid[worker-proc]=not_found"
        );
        assert_eq!(
            trim_nul(&channel.render(DiscoveryStatus::Error(StatusError::NoAnchor))),
            b"pid[worker-proc]=error:no_anchor"
        );
    }

    #[test]
    fn test_render_truncates_to_capacity() {
        let host = SimulatedHost::new(SimLayout::default());
        let accessor = host.accessor();
        let address = accessor.handle(host.channel_address()).unwrap();
        let channel = ResultChannel::new(accessor, address, 12, "pid[worker-proc]".to_string());

        let rendered = channel.render(DiscoveryStatus::Found(4242));
        assert_eq!(rendered.len(), 12);
        assert_eq!(&rendered[..11], b"pid[worker-");
        assert_eq!(rendered[11], 0);
    }

    #[test]
    fn test_publish_then_restore_is_byte_exact() {
        let host = SimulatedHost::new(SimLayout::default());
        let channel = channel(&host, "pid[init]");
        let original = host
            .memory()
            .read_bytes(host.channel_address(), 65)
            .unwrap();

        channel.publish(DiscoveryStatus::NotYetRunning).unwrap();
        channel.publish(DiscoveryStatus::Found(1)).unwrap();
        assert_eq!(channel.read_text().unwrap(), "pid[init]=1");

        channel.restore().unwrap();
        let restored = host
            .memory()
            .read_bytes(host.channel_address(), 65)
            .unwrap();
        assert_eq!(restored, original);

        // second restore is a no-op, and the channel stays closed
        channel.restore().unwrap();
        assert_eq!(channel.read_text().unwrap(), host.channel_text());
        assert!(matches!(
            channel.publish(DiscoveryStatus::Found(1)),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(
            host.memory()
                .read_bytes(host.channel_address(), 65)
                .unwrap(),
            original
        );
    }

    #[test]
    fn test_failed_restore_can_be_retried() {
        let host = SimulatedHost::new(SimLayout::default());
        let channel = channel(&host, "pid[init]");
        let original = host.channel_text();
        channel.publish(DiscoveryStatus::Found(1)).unwrap();

        let region = host.memory().unmap(host.uts_address()).unwrap();
        assert!(matches!(channel.restore(), Err(Error::Unmapped { .. })));
        // closed even though the write failed
        assert!(matches!(
            channel.publish(DiscoveryStatus::Found(2)),
            Err(Error::InvalidState(_))
        ));

        host.memory().map(host.uts_address(), region);
        assert_eq!(host.channel_text(), "pid[init]=1");
        channel.restore().unwrap();
        assert_eq!(host.channel_text(), original);
    }

    #[test]
    fn test_restore_without_publish() {
        let host = SimulatedHost::new(SimLayout::default());
        let before = host.channel_text();
        channel(&host, "pid[init]").restore().unwrap();
        assert_eq!(host.channel_text(), before);
    }

    #[test]
    fn test_publish_if_changed() {
        let host = SimulatedHost::new(SimLayout::default());
        let channel = channel(&host, "pid[init]");

        assert!(channel.publish_if_changed(DiscoveryStatus::Found(1)).unwrap());
        assert!(!channel.publish_if_changed(DiscoveryStatus::Found(1)).unwrap());
        assert!(channel.publish_if_changed(DiscoveryStatus::NotYetRunning).unwrap());
    }

    #[test]
    fn test_splice() {
        let host = SimulatedHost::new(SimLayout::default());
        let channel = channel(&host, "pid[init]");
        let mut output = vec![0xEEu8; 390];

        assert!(!channel.splice(&mut output, 195));

        channel.publish(DiscoveryStatus::Found(1)).unwrap();
        assert!(channel.splice(&mut output, 195));
        assert_eq!(trim_nul(&output[195..260]), b"pid[init]=1");
        assert_eq!(output[194], 0xEE);
        assert_eq!(output[260], 0xEE);

        let mut short = vec![0u8; 100];
        assert!(!channel.splice(&mut short, 195));
    }
}

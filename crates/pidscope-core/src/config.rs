//! Configuration for a pidscope load
//!
//! Every host-specific literal (symbol names, entry points, field offsets,
//! scan caps) lives here with a default for the most common build family.
//! Configurations are read from TOML; missing keys take their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::memory::layout::{FALLBACK_PROFILES, FallbackProfile, fallback_profile, scan};
use crate::offset::LayoutOffsets;

/// Width of one `new_utsname` field, terminator included
const UTS_FIELD_LEN: usize = 65;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidscopeConfig {
    pub target: TargetConfig,
    pub reference: ReferenceConfig,
    pub scan: ScanConfig,
    pub channel: ChannelConfig,
    pub intercept: InterceptConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Name searched for when the load argument is empty
    pub default_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Symbol of the descriptor used for calibration.
    ///
    /// Must name the descriptor whose identifier and name are
    /// `expected_id` and `expected_name`. On stock Linux `init_task` is the
    /// idle task (pid 0, `swapper/0`), not pid 1, so hosts without a pid-1
    /// symbol must point this at one or calibration falls back.
    pub symbol: String,
    pub expected_id: u32,
    pub expected_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Calibration window in bytes, capped at `scan::MAX_WINDOW`
    pub window: usize,
    pub max_walk_nodes: usize,
    pub kernel_marker: u64,
    /// Name of the built-in fallback profile
    pub fallback_profile: String,
    /// Custom fallback offsets, used instead of the named profile
    pub fallback_offsets: Option<LayoutOffsets>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Symbol holding the published text field
    pub symbol: String,
    /// Offset of the text field from the symbol
    pub field_offset: usize,
    /// Field capacity, terminator included
    pub capacity: usize,
    /// Label written before `=`; the target name is appended in brackets
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Entry point every process calls to ask for its own identifier
    pub query_entry: String,
    /// Entry point that copies the published field out to callers
    pub publish_read_entry: String,
    /// Offset of the published field inside that entry point's output
    pub output_field_offset: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            default_name: "init".to_string(),
        }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        // the host must export `init_task` as its pid-1 descriptor for these to agree
        Self {
            symbol: "init_task".to_string(),
            expected_id: 1,
            expected_name: "init".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window: scan::DEFAULT_WINDOW,
            max_walk_nodes: scan::MAX_WALK_NODES,
            kernel_marker: scan::KERNEL_ADDRESS_MARKER,
            fallback_profile: FALLBACK_PROFILES[0].name.to_string(),
            fallback_offsets: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            symbol: "init_uts_ns".to_string(),
            // kref (4) + sysname, nodename, release
            field_offset: 4 + UTS_FIELD_LEN * 3,
            capacity: UTS_FIELD_LEN,
            label: "pid".to_string(),
        }
    }
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            query_entry: "__arm64_sys_getpid".to_string(),
            publish_read_entry: "__arm64_sys_newuname".to_string(),
            output_field_offset: UTS_FIELD_LEN * 3,
        }
    }
}

impl PidscopeConfig {
    /// Create a new configuration builder
    pub fn builder() -> PidscopeConfigBuilder {
        PidscopeConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Fallback profile name and offsets selected by this configuration
    pub fn fallback(&self) -> (String, LayoutOffsets) {
        match self.scan.fallback_offsets {
            Some(offsets) => ("custom".to_string(), offsets),
            None => {
                let FallbackProfile { name, offsets } = *fallback_profile(&self.scan.fallback_profile);
                (name.to_string(), offsets)
            }
        }
    }
}

/// Builder for PidscopeConfig
#[derive(Debug, Clone, Default)]
pub struct PidscopeConfigBuilder {
    default_name: Option<String>,
    reference: Option<ReferenceConfig>,
    window: Option<usize>,
    max_walk_nodes: Option<usize>,
    fallback_profile: Option<String>,
    fallback_offsets: Option<LayoutOffsets>,
    label: Option<String>,
}

impl PidscopeConfigBuilder {
    /// Set the target used when the load argument is empty
    pub fn default_name<S: Into<String>>(mut self, name: S) -> Self {
        self.default_name = Some(name.into());
        self
    }

    /// Set the reference descriptor symbol and its known values
    pub fn reference<S: Into<String>, N: Into<String>>(
        mut self,
        symbol: S,
        expected_id: u32,
        expected_name: N,
    ) -> Self {
        self.reference = Some(ReferenceConfig {
            symbol: symbol.into(),
            expected_id,
            expected_name: expected_name.into(),
        });
        self
    }

    /// Set the calibration window size
    pub fn window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    /// Set the process list walk ceiling
    pub fn max_walk_nodes(mut self, max: usize) -> Self {
        self.max_walk_nodes = Some(max);
        self
    }

    /// Select a built-in fallback profile by name
    pub fn fallback_profile<S: Into<String>>(mut self, name: S) -> Self {
        self.fallback_profile = Some(name.into());
        self
    }

    /// Use custom fallback offsets
    pub fn fallback_offsets(mut self, offsets: LayoutOffsets) -> Self {
        self.fallback_offsets = Some(offsets);
        self
    }

    /// Set the channel label
    pub fn label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> PidscopeConfig {
        let mut config = PidscopeConfig::default();
        if let Some(name) = self.default_name {
            config.target.default_name = name;
        }
        if let Some(reference) = self.reference {
            config.reference = reference;
        }
        if let Some(window) = self.window {
            config.scan.window = window;
        }
        if let Some(max) = self.max_walk_nodes {
            config.scan.max_walk_nodes = max;
        }
        if let Some(profile) = self.fallback_profile {
            config.scan.fallback_profile = profile;
        }
        if self.fallback_offsets.is_some() {
            config.scan.fallback_offsets = self.fallback_offsets;
        }
        if let Some(label) = self.label {
            config.channel.label = label;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::Error;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = PidscopeConfig::default();
        assert_eq!(config.target.default_name, "init");
        assert_eq!(config.reference.expected_id, 1);
        assert_eq!(config.channel.capacity, 65);
        assert_eq!(config.channel.field_offset, 0xC7);
        assert_eq!(config.intercept.output_field_offset, 0xC3);
        assert_eq!(config.scan.kernel_marker, 0xFFFF_0000_0000_0000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PidscopeConfig::from_toml(
            r#"
            [target]
            default_name = "worker-proc"

            [scan]
            window = 4096
            fallback_profile = "linux-6.x-x86_64"
            "#,
        )
        .unwrap();

        assert_eq!(config.target.default_name, "worker-proc");
        assert_eq!(config.scan.window, 4096);
        assert_eq!(config.reference, ReferenceConfig::default());
        assert_eq!(config.fallback().0, "linux-6.x-x86_64");
    }

    #[test]
    fn test_custom_fallback_offsets() {
        let config = PidscopeConfig::from_toml(
            r#"
            [scan.fallback_offsets]
            identifier = 16
            name = 32
            link = 64
            "#,
        )
        .unwrap();

        let (name, offsets) = config.fallback();
        assert_eq!(name, "custom");
        assert_eq!(
            offsets,
            LayoutOffsets {
                identifier: 16,
                name: 32,
                link: 64
            }
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[channel]\nlabel = \"tgid\"").unwrap();

        let config = PidscopeConfig::load(file.path()).unwrap();
        assert_eq!(config.channel.label, "tgid");
        assert_eq!(config.channel.symbol, "init_uts_ns");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            PidscopeConfig::from_toml("[scan]\nwindow = \"big\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = PidscopeConfig::builder()
            .default_name("worker-proc")
            .reference("swapper_task", 2, "kthreadd")
            .window(0x1000)
            .max_walk_nodes(64)
            .label("tgid")
            .build();

        assert_eq!(config.target.default_name, "worker-proc");
        assert_eq!(config.reference.symbol, "swapper_task");
        assert_eq!(config.reference.expected_id, 2);
        assert_eq!(config.scan.window, 0x1000);
        assert_eq!(config.scan.max_walk_nodes, 64);
        assert_eq!(config.channel.label, "tgid");
    }
}

//! Command implementations for vmfabric-cmd

use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;
use vmfabric::{DeviceOrdinal, VirtualMemoryFabric, host::HostDriverOptions};
use vmfabric_barrier::WaitPolicy;

pub mod alloc_cycle;
pub mod barrier;
pub mod export_import;
pub mod reserve;

/// Settings read from the `--config` file. Every section is optional.
///
/// ```json
/// {
///   "host": { "device_count": 4, "granularity": 65536 },
///   "wait": { "spin_iterations": 1024 }
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CmdConfig {
    pub host: HostDriverOptions,
    pub wait: WaitPolicy,
}

impl CmdConfig {
    pub fn load(path: Option<&Path>) -> Result<CmdConfig> {
        let Some(path) = path else {
            return Ok(CmdConfig::default());
        };
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;
        let config: CmdConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.host.validate().context("Invalid host driver options")?;
        Ok(config)
    }

    pub fn fabric(&self) -> Result<VirtualMemoryFabric> {
        VirtualMemoryFabric::host(self.host.clone()).context("Failed to create the host driver")
    }
}

/// `requested` bytes, or one granularity unit of `device` if absent.
pub fn size_or_granule(
    fabric: &VirtualMemoryFabric,
    device: DeviceOrdinal,
    requested: Option<u64>,
) -> Result<usize> {
    match requested {
        Some(size) => usize::try_from(size).context("Size does not fit the address space"),
        None => Ok(fabric.granularity(device)?),
    }
}

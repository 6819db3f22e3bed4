//! Reserve command implementation

use std::time::Instant;

use anyhow::{Context, Result};
use vmfabric::DeviceOrdinal;

use crate::{commands::CmdConfig, utils::format_size};

pub fn run(config: &CmdConfig, device: u32, size: u64) -> Result<()> {
    let fabric = config.fabric()?;
    let device = DeviceOrdinal::new(device);
    let size = usize::try_from(size).context("Size does not fit the address space")?;

    let start = Instant::now();
    let address = fabric
        .reserve(device, size)
        .with_context(|| format!("Failed to reserve {} on {device}", format_size(size as u64)))?;
    let reserved = start.elapsed();
    fabric.release(address, size)?;

    println!(
        "Reserved {} at {address} on {device} in {reserved:.3?}, released in {:.3?}",
        format_size(size as u64),
        start.elapsed() - reserved
    );
    Ok(())
}
